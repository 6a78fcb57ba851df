//! Structured operation log (§4.9's taxonomy): `(status, operation,
//! initiator, ip, details)`, rendered as a single `log::info!`/`log::warn!`
//! line per row with an ISO-8601 timestamp. Riding on `log`/`env_logger`
//! rather than a bespoke writer means `RUST_LOG` controls verbosity the
//! ordinary way; the taxonomy's own Success/Fail tag is orthogonal to the
//! log level, so both land at the default level operators already see.

use crate::changes::Initiator;

pub fn init() {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format(|buf, record| {
        use std::io::Write;
        let ts = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        writeln!(buf, "{} {} {}", ts, record.level(), record.args())
    });
    builder.init();
}

/// Renders `initiator`/identity into the `group / channel / role / login`
/// path the source's logger prints, or just the group for a group-level
/// initiator, or `~` for root.
fn initiator_path(initiator: Initiator, identity: &str, group: &str, channel: &str) -> String {
    match initiator {
        Initiator::Root => "~".to_string(),
        Initiator::Group => group.to_string(),
        Initiator::Consumer => format!("{group} / {channel} / consumer / {identity}"),
        Initiator::Producer => format!("{group} / {channel} / producer / {identity}"),
    }
}

fn details_str(details: &[(&str, &str)]) -> String {
    details
        .iter()
        .map(|(k, v)| format!("{k} : {v}"))
        .collect::<Vec<_>>()
        .join(", ")
}

pub struct LogCtx<'a> {
    pub operation: &'a str,
    pub initiator: Initiator,
    pub identity: &'a str,
    pub group: &'a str,
    pub channel: &'a str,
    pub ip: &'a str,
}

pub fn success(ctx: LogCtx, details: &[(&str, &str)]) {
    log::info!(
        "Success | {} | {} | ip={} | {}",
        ctx.operation,
        initiator_path(ctx.initiator, ctx.identity, ctx.group, ctx.channel),
        ctx.ip,
        details_str(details)
    );
}

pub fn fail(ctx: LogCtx, details: &[(&str, &str)], error: &dyn std::fmt::Display) {
    log::warn!(
        "Fail | {} | {} | ip={} | {} | error={}",
        ctx.operation,
        initiator_path(ctx.initiator, ctx.identity, ctx.group, ctx.channel),
        ctx.ip,
        details_str(details),
        error
    );
}
