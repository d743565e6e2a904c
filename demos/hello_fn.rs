//! Minimal hot function. Run with the variables the platform would set:
//!
//! ```text
//! FN_FORMAT=http-stream FN_LISTENER=unix:/tmp/iofs/lsnr.sock FDK_DEBUG=1 \
//!     cargo run --example hello_fn
//! ```

use fdk_h1::{Body, Config, Error, FnResponse, HandlerError, InvokeContext, Reply};

fn hello(ctx: InvokeContext, mut body: Body) -> Result<Reply, HandlerError> {
    Ok(Reply::pending(async move {
        let input = body.read_to_string().await?;
        let name = match input.trim() {
            "" => "World",
            n => n,
        };

        log::info!("{} greets {}", ctx.call_id(), name);

        let res = FnResponse::new(format!("Hello {}!\n", name)).with_header("X-Greeted", name);

        Ok(res.into())
    }))
}

#[async_std::main]
async fn main() -> Result<(), Error> {
    let config = Config::from_env()?;

    let level = if config.debug() {
        log::LevelFilter::Trace
    } else {
        log::LevelFilter::Info
    };
    pretty_env_logger::formatted_builder()
        .filter_level(log::LevelFilter::Warn)
        .filter_module("fdk_h1", level)
        .filter_module("hello_fn", level)
        .init();

    fdk_h1::run(config, hello).await
}
