use haggle::simulation::Simulation;

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt::init();

    Simulation::new().run().await.unwrap();
}
