mod app;
mod calibration;
mod clock;
mod connectivity;
mod display;
mod host;
mod input;
mod mqtt;
mod pump;
mod remote_log;
mod signals;
mod store;
mod watchdog;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    host::run().await
}
