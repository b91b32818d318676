use envertech_bridge::prelude::*;

#[tokio::main]
async fn main() {
    let options = Options::new();

    if let Err(e) = envertech_bridge::run(options).await {
        error!("{:?}", e);
        std::process::exit(255);
    }
}
