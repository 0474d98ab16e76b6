fn main() {
    if let Err(e) = serialdeck_lib::run_cli() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
