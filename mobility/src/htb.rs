//! §4.9: HTB shaping used during a handover so the user's traffic is held
//! back for exactly the new link's propagation delay instead of dropping
//! packets outright while the SRv6 route swings over.

use anyhow::{Context as _, Result};
use netsat_command::CommandRunner;
use std::net::Ipv6Addr;
use std::time::{Duration, Instant};

const ROOT_HANDLE: &str = "1:";
const DEFAULT_CLASS: &str = "20";
const CEILING_RATE: &str = "10gbit";
/// The last stretch of a throttle window is busy-waited instead of slept,
/// since `tokio::time::sleep` resolution on a loaded host can overshoot a
/// handover-delay budget measured in single-digit milliseconds.
const BUSY_WAIT_TAIL: Duration = Duration::from_micros(200);

/// Ensures the root `htb` qdisc and its default class exist on `ifname`.
/// Idempotent: a second call against an already-configured interface is a
/// harmless no-op `replace`.
pub async fn ensure_root_qdisc(command: &dyn CommandRunner, ifname: &str) -> Result<()> {
    command
        .run_checked("tc", &["qdisc", "replace", "dev", ifname, "root", "handle", ROOT_HANDLE, "htb", "default", DEFAULT_CLASS])
        .await
        .context("installing root htb qdisc")?;

    command
        .run_checked(
            "tc",
            &["class", "replace", "dev", ifname, "parent", ROOT_HANDLE, "classid", &format!("{ROOT_HANDLE}{DEFAULT_CLASS}"), "htb", "rate", CEILING_RATE],
        )
        .await
        .context("installing default htb class")?;

    Ok(())
}

/// A per-peer htb class plus a flower filter steering that peer's IPv6
/// traffic into it, so each user can be throttled independently during its
/// own handover without affecting siblings.
pub async fn ensure_peer_class(command: &dyn CommandRunner, ifname: &str, peer_index: u32, peer_ipv6: Ipv6Addr) -> Result<String> {
    let classid = format!("{ROOT_HANDLE}{}", peer_index + 10);

    command
        .run_checked("tc", &["class", "replace", "dev", ifname, "parent", ROOT_HANDLE, "classid", &classid, "htb", "rate", CEILING_RATE, "ceil", CEILING_RATE])
        .await
        .context("installing per-peer htb class")?;

    command
        .run_checked(
            "tc",
            &[
                "filter", "replace", "dev", ifname, "parent", ROOT_HANDLE, "protocol", "ipv6", "flower", "dst_ip",
                &format!("{peer_ipv6}/128"), "classid", &classid,
            ],
        )
        .await
        .context("installing flower filter for peer class")?;

    Ok(classid)
}

/// Throttles `classid` to the rate a packet of `mtu_bytes` would need to
/// clear in exactly `delay_ms`, holds it there for `delay_ms`, then restores
/// the class to full ceiling. The hold uses a monotonic deadline: sleep
/// through the bulk of it, busy-wait the final [`BUSY_WAIT_TAIL`] so the
/// restore lands within microseconds of the intended delay rather than
/// however long the scheduler feels like giving back.
pub async fn throttle_for_delay(command: &dyn CommandRunner, ifname: &str, classid: &str, mtu_bytes: u32, delay_ms: f64) -> Result<()> {
    let kbit = (mtu_bytes as f64 * 8.0 / delay_ms).max(1.0);
    let rate = format!("{}kbit", kbit.round() as u64);

    command
        .run_checked("tc", &["class", "change", "dev", ifname, "parent", ROOT_HANDLE, "classid", classid, "htb", "rate", &rate, "ceil", &rate])
        .await
        .context("throttling htb class for handover")?;

    let deadline = Instant::now() + Duration::from_secs_f64(delay_ms / 1000.0);
    wait_until(deadline).await;

    command
        .run_checked("tc", &["class", "change", "dev", ifname, "parent", ROOT_HANDLE, "classid", classid, "htb", "rate", CEILING_RATE, "ceil", CEILING_RATE])
        .await
        .context("restoring htb class after handover")?;

    Ok(())
}

async fn wait_until(deadline: Instant) {
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining <= BUSY_WAIT_TAIL {
            break;
        }
        tokio::time::sleep(remaining - BUSY_WAIT_TAIL).await;
    }

    while Instant::now() < deadline {
        std::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netsat_command::RecordingCommandRunner;

    #[tokio::test]
    async fn root_qdisc_sets_up_default_class_at_ceiling() {
        let command = RecordingCommandRunner::new();
        ensure_root_qdisc(command.as_ref(), "vl_gs1_1").await.unwrap();

        assert!(command.was_run("tc", &["qdisc", "replace", "dev", "vl_gs1_1", "root", "handle", "1:", "htb", "default", "20"]));
        assert!(command.was_run("tc", &["class", "replace", "dev", "vl_gs1_1", "parent", "1:", "classid", "1:20", "htb", "rate", "10gbit"]));
    }

    #[tokio::test]
    async fn peer_class_gets_a_matching_flower_filter() {
        let command = RecordingCommandRunner::new();
        let peer: Ipv6Addr = "fd00:1::user1".parse().unwrap();
        let classid = ensure_peer_class(command.as_ref(), "vl_gs1_1", 0, peer).await.unwrap();

        assert_eq!(classid, "1:10");
        assert!(command.was_run(
            "tc",
            &["filter", "replace", "dev", "vl_gs1_1", "parent", "1:", "protocol", "ipv6", "flower", "dst_ip", "fd00:1::user1/128", "classid", "1:10"],
        ));
    }

    #[tokio::test]
    async fn throttle_computes_rate_from_mtu_and_delay_then_restores() {
        let command = RecordingCommandRunner::new();
        throttle_for_delay(command.as_ref(), "vl_gs1_1", "1:10", 1350, 10.0).await.unwrap();

        // 1350 bytes * 8 bits / 10ms = 1080 kbit/s.
        assert!(command.was_run("tc", &["class", "change", "dev", "vl_gs1_1", "parent", "1:", "classid", "1:10", "htb", "rate", "1080kbit", "ceil", "1080kbit"]));
        assert!(command.was_run("tc", &["class", "change", "dev", "vl_gs1_1", "parent", "1:", "classid", "1:10", "htb", "rate", "10gbit", "ceil", "10gbit"]));
    }
}
