use relay_server::app;

#[tokio::main]
async fn main() {
    app::run().await;
}
