use warden::cli::Cli;

fn main() {
    match Cli::run() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("✗ Error: {}", e);
            std::process::exit(e.exit_code());
        }
    }
}
