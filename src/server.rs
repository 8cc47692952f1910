use std::sync::Arc;

use anyhow::Result;
use service::{Context, ContextOption};
use tokio::net::UdpSocket;

use crate::{config::Config, observer::Observer, statistics::Monitor};

/// Bind the udp socket and bring a context up from the configuration:
/// apply the options, then install every rule.
pub async fn run(config: Arc<Config>, monitor: Monitor) -> Result<Context<Observer>> {
    let socket = UdpSocket::bind(config.tunnel.bind).await?;
    if let Some(peer) = config.tunnel.peer {
        socket.connect(peer).await?;
    }

    log::info!(
        "tunnel server listening: addr={}, peer={:?}",
        config.tunnel.bind,
        config.tunnel.peer
    );

    let context = Context::new(Arc::new(socket), Observer::new(monitor));

    let options = &config.options;
    for (option, value) in [
        (ContextOption::UdpTimeout, options.udp_timeout),
        (ContextOption::UdpRetries, options.udp_retries),
        (ContextOption::SlideWindow, options.slide_window),
        (ContextOption::SessionTimeout, options.session_timeout),
        (ContextOption::DebugDelay, options.debug_delay),
        (ContextOption::DebugPacketLoss, options.debug_packet_loss),
        (ContextOption::DebugBandwidth, options.debug_bandwidth),
    ] {
        context.set_option(option, value)?;
    }

    for forward in &config.rules {
        context
            .add_rule(
                forward.mode.as_rule_mode(),
                &forward.service,
                forward.address,
            )
            .await?;
    }

    Ok(context)
}
