use futures_util::future::BoxFuture;
use regex::Regex;
use std::sync::OnceLock;
use tracing::{debug, warn};

/// Answers "is this hardware address currently reachable on the local
/// network". Queries are slow (hundreds of milliseconds to seconds) and may
/// report false negatives; callers own the timeout.
pub trait PresenceOracle: Send + Sync {
    fn is_present<'a>(&'a self, hardware_addr: &'a str) -> BoxFuture<'a, bool>;
}

/// Production oracle: reads the kernel neighbor table (`ip neigh show`),
/// falling back to `arp -a` where iproute2 is unavailable.
#[derive(Default)]
pub struct NeighborScan;

impl NeighborScan {
    pub fn new() -> Self {
        Self
    }

    async fn connected_macs() -> Vec<String> {
        match scan_command("ip", &["neigh", "show"]).await {
            Ok(output) if !output.trim().is_empty() => return extract_macs(&output),
            Ok(_) => debug!(event = "neighbor_scan_empty", tool = "ip"),
            Err(err) => warn!(event = "neighbor_scan_error", tool = "ip", error = %err),
        }

        match scan_command("arp", &["-a"]).await {
            Ok(output) => extract_macs(&output),
            Err(err) => {
                warn!(event = "neighbor_scan_error", tool = "arp", error = %err);
                Vec::new()
            }
        }
    }
}

impl PresenceOracle for NeighborScan {
    fn is_present<'a>(&'a self, hardware_addr: &'a str) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let target = hardware_addr.trim().to_lowercase();
            let macs = Self::connected_macs().await;
            let present = macs.iter().any(|mac| *mac == target);
            debug!(event = "presence_checked", mac = %target, present, seen = macs.len());
            present
        })
    }
}

async fn scan_command(program: &str, args: &[&str]) -> Result<String, String> {
    let program = program.to_string();
    let args = args.iter().map(|arg| arg.to_string()).collect::<Vec<_>>();
    let output = tokio::task::spawn_blocking(move || {
        std::process::Command::new(&program).args(&args).output()
    })
    .await
    .map_err(|err| format!("join_error:{err}"))
    .and_then(|result| result.map_err(|err| format!("spawn_error:{err}")))?;

    if !output.status.success() {
        return Err(format!("exit:{}", output.status));
    }
    String::from_utf8(output.stdout).map_err(|err| format!("utf8:{err}"))
}

fn extract_macs(output: &str) -> Vec<String> {
    static MAC_RE: OnceLock<Regex> = OnceLock::new();
    let re = MAC_RE.get_or_init(|| {
        Regex::new(r"(?i)\b[0-9a-f]{2}(?:[:-][0-9a-f]{2}){5}\b").expect("mac pattern")
    });
    re.find_iter(output)
        .map(|found| found.as_str().replace('-', ":").to_lowercase())
        .collect()
}
