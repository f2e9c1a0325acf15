use anyhow::Result;
use clap::Parser;
use tracing::info;

use kbrobot::application::application::Application;
use kbrobot::application::background::BackgroundTasks;
use kbrobot::application::config::configuration::Configuration;
use kbrobot::webserver;

#[tokio::main]
async fn main() -> Result<()> {
    let configuration = Configuration::parse();

    Application::install_logging(&configuration);
    let app = Application::initialize(configuration).await?;
    info!(port = app.config.port, "kbrobot initialized");

    let background = BackgroundTasks::start(&app);

    let result = webserver::start(app).await;
    background.shutdown();
    result
}
