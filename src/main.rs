use tracing::info;
use tracing_subscriber::EnvFilter;
use warp::Filter;
use lmpool::{config::Config, context::AppContext, routes::routes, sweeper};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let config = Config::from_env()?;
  let port = config.server_port;
  let ctx = AppContext::build(config).await?;

  tokio::spawn(sweeper::run(ctx.clone()));

  let api = routes(ctx).with(warp::trace::request());
  info!("Coordinator listening on port {}", port);
  warp::serve(api)
    .run(([0, 0, 0, 0], port))
    .await;
  Ok(())
}
