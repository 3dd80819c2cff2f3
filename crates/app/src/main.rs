#[tokio::main]
async fn main() {
    if let Err(error) = w2x_app::run_from_env().await {
        tracing::error!("{error:#}");
        std::process::exit(1);
    }
}
