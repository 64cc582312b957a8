#![forbid(unsafe_code)]

use std::io::IsTerminal;

use argh::FromArgs;
use confique::Config;
use simple_logger::SimpleLogger;
use time::UtcOffset;

use crate::{
    session::{Session, StreamClient},
    transport::HttpTransport,
};

mod aggregate;
mod buffer;
mod frame;
mod http_util;
mod render;
mod session;
mod sse;
mod transport;
mod view;

#[derive(FromArgs, Debug)]
#[argh(description = "Live viewer for a metrics push feed.")]
struct ViewerArgs {
    #[argh(option, short = 'H', description = "only show metrics from this host")]
    pub host: Option<String>,
    #[argh(
        option,
        short = 'a',
        description = "base URL of the metrics API, overrides the config file"
    )]
    pub api_url: Option<String>,
    #[argh(
        option,
        short = 'c',
        default = "\"nazar.toml\".to_string()",
        description = "path to config file"
    )]
    pub config: String,
    #[argh(
        switch,
        short = '6',
        description = "prefer IPv6 when resolving the feed address"
    )]
    pub prefer_ipv6: bool,
    #[argh(switch, description = "print the first view that has data, then exit")]
    pub once: bool,
}

#[derive(Config, Debug)]
struct Conf {
    /// Base URL of the metrics API
    #[config(env = "NAZAR_API_URL", default = "http://localhost:8000")]
    base_url: String,

    /// Prefer IPv6 when resolving the feed address
    #[config(env = "NAZAR_PREFER_IPV6", default = false)]
    prefer_ipv6: bool,
}

fn config(path: &str) -> anyhow::Result<Conf> {
    Conf::builder()
        .env()
        .file(path)
        .load()
        .map_err(|e| e.into())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // only reliable while the process is single threaded
    let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);

    SimpleLogger::new().env().init()?;

    let args: ViewerArgs = argh::from_env();
    log::debug!("Viewer args: {args:#?}");

    let conf = config(&args.config)?;
    log::debug!("Viewer config: {conf:#?}");

    let once = args.once;
    let base_url = args.api_url.unwrap_or(conf.base_url);
    let transport = HttpTransport::new(args.prefer_ipv6 || conf.prefer_ipv6);
    let mut client = StreamClient::new(transport, base_url);
    let mut view = client.subscribe();

    client.open(args.host).await?;
    log::info!(
        "watching {}",
        client
            .session()
            .and_then(Session::filter)
            .unwrap_or("all hosts")
    );

    let clear_screen = std::io::stdout().is_terminal();
    let res: anyhow::Result<()> = async {
        loop {
            tokio::select! {
                res = tokio::signal::ctrl_c() => {
                    res?;
                    log::info!("interrupted, shutting down");
                    return Ok(());
                }
                changed = view.changed() => changed?,
            }

            let (text, has_data) = {
                let view = view.borrow_and_update();
                (render::render(&view, offset), !view.records.is_empty())
            };
            if clear_screen {
                print!("\x1b[2J\x1b[H");
            }
            println!("{text}");

            if once && has_data {
                return Ok(());
            }
        }
    }
    .await;

    client.close().await;
    res
}
