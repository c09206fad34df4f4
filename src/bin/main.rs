//! Binary entrypoint for the superobjective tool

#[tokio::main]
async fn main() {
    if let Err(err) = superobjective::cli::run().await {
        eprintln!("Error: {}", err);
        std::process::exit(1);
    }
}
