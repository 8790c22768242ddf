fn main() {
    // Load .env file if present (for development convenience)
    let _ = dotenvy::dotenv();
    recorder_lib::init_logging();

    if let Err(e) = recorder_lib::run() {
        log::error!("{}", e);
        std::process::exit(1);
    }
}
