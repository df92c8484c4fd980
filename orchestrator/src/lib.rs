//! C3: the worker orchestrator. Operates host-to-host over SSH (§4.3);
//! every step is idempotent and teardown is best-effort (failures are
//! collected, not propagated).

mod remote;

pub use remote::{RecordingRemoteRunner, RemoteRunner, SshRunner};

use anyhow::Result;
use ip_network::Ipv4Network;
use netsat_model::{Node, Worker};
use std::net::Ipv4Addr;
use std::sync::Arc;

/// Default global supernet all worker overlay sub-CIDRs are carved from
/// (§4.3 step 1).
pub fn default_supernet() -> Ipv4Network {
    Ipv4Network::new(Ipv4Addr::new(172, 0, 0, 0), 8).expect("well-formed constant")
}

pub const DOCKER_USER_COMMENT: &str = "netsatbench-overlay";
pub const MASQUERADE_COMMENT: &str = "netsatbench-egress";

/// Accumulates failures across a best-effort teardown loop (§4.3 "Teardown
/// ... is best-effort: failure to remove one rule does not abort the
/// cleanup loop, but every failure is surfaced").
#[derive(Debug, Default)]
pub struct TeardownSummary {
    pub failures: Vec<(String, String)>,
}

impl TeardownSummary {
    pub fn record(&mut self, step: impl Into<String>, result: Result<()>) {
        if let Err(e) = result {
            self.failures.push((step.into(), e.to_string()));
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct WorkerOrchestrator<R: RemoteRunner> {
    runner: Arc<R>,
    supernet: Ipv4Network,
    egress_interface: String,
    image: String,
    etcd_endpoint: String,
}

impl<R: RemoteRunner> WorkerOrchestrator<R> {
    pub fn new(runner: Arc<R>, image: impl Into<String>, etcd_endpoint: impl Into<String>) -> Self {
        Self {
            runner,
            supernet: default_supernet(),
            egress_interface: "eth0".to_owned(),
            image: image.into(),
            etcd_endpoint: etcd_endpoint.into(),
        }
    }

    pub fn with_supernet(mut self, supernet: Ipv4Network) -> Self {
        self.supernet = supernet;
        self
    }

    pub fn with_egress_interface(mut self, iface: impl Into<String>) -> Self {
        self.egress_interface = iface.into();
        self
    }

    /// §4.3 steps 1-3: idempotent per-worker overlay setup.
    pub async fn prepare_worker(&self, worker: &Worker, all_workers: &[Worker]) -> Result<()> {
        self.ensure_overlay_network(worker).await?;

        for other in all_workers {
            if other.name == worker.name {
                continue;
            }

            if let Some(other_subnet) = other.overlay_subnet {
                self.install_route(worker, other_subnet, &other.ip).await?;
            }
        }

        self.ensure_docker_user_rule(worker).await?;
        self.ensure_masquerade_rule(worker).await?;

        Ok(())
    }

    /// §4.3 step 4: one `docker run` per node assigned to this worker.
    pub async fn deploy_node(&self, worker: &Worker, node: &Node) -> Result<()> {
        let node_name = node.name.to_string();

        self.runner
            .run(
                worker,
                "docker",
                &[
                    "run",
                    "-d",
                    "--name",
                    &node_name,
                    "--network",
                    &overlay_network_name(worker),
                    "--cap-add",
                    "NET_ADMIN",
                    "--cap-add",
                    "NET_RAW",
                    "--privileged",
                    "-e",
                    &format!("NODE_NAME={node_name}"),
                    "-e",
                    &format!("ETCD_ENDPOINT={}", self.etcd_endpoint),
                    &self.image,
                ],
            )
            .await?;

        Ok(())
    }

    pub async fn remove_node(&self, worker: &Worker, node: &Node) -> Result<()> {
        self.runner
            .run(worker, "docker", &["rm", "-f", &node.name.to_string()])
            .await?;
        Ok(())
    }

    /// Mirror image of [`Self::prepare_worker`], best-effort.
    pub async fn teardown_worker(&self, worker: &Worker, nodes: &[Node]) -> TeardownSummary {
        let mut summary = TeardownSummary::default();

        for node in nodes {
            summary.record(format!("remove node {}", node.name), self.remove_node(worker, node).await);
        }

        summary.record("remove DOCKER-USER rule", self.remove_docker_user_rule(worker).await);
        summary.record("remove masquerade rule", self.remove_masquerade_rule(worker).await);
        summary.record(
            "remove overlay network",
            self.runner
                .run(worker, "docker", &["network", "rm", &overlay_network_name(worker)])
                .await
                .map(|_| ()),
        );

        summary
    }

    async fn ensure_overlay_network(&self, worker: &Worker) -> Result<()> {
        let name = overlay_network_name(worker);
        let exists = self.runner.run(worker, "docker", &["network", "inspect", &name]).await?;

        if exists.success() {
            return Ok(());
        }

        let subnet = worker
            .overlay_subnet
            .map(|s| s.to_string())
            .unwrap_or_else(|| self.supernet.to_string());

        self.runner
            .run(
                worker,
                "docker",
                &["network", "create", "--subnet", &subnet, &name],
            )
            .await?;

        Ok(())
    }

    async fn install_route(&self, worker: &Worker, dst: Ipv4Network, via: &str) -> Result<()> {
        self.runner
            .run(worker, "ip", &["route", "replace", &dst.to_string(), "via", via])
            .await?;
        Ok(())
    }

    async fn ensure_docker_user_rule(&self, worker: &Worker) -> Result<()> {
        let supernet = self.supernet.to_string();
        let check = self
            .runner
            .run(
                worker,
                "iptables",
                &[
                    "-C",
                    "DOCKER-USER",
                    "-s",
                    &supernet,
                    "-d",
                    &supernet,
                    "-j",
                    "ACCEPT",
                    "-m",
                    "comment",
                    "--comment",
                    DOCKER_USER_COMMENT,
                ],
            )
            .await?;

        if check.success() {
            return Ok(());
        }

        self.runner
            .run(
                worker,
                "iptables",
                &[
                    "-I",
                    "DOCKER-USER",
                    "-s",
                    &supernet,
                    "-d",
                    &supernet,
                    "-j",
                    "ACCEPT",
                    "-m",
                    "comment",
                    "--comment",
                    DOCKER_USER_COMMENT,
                ],
            )
            .await?;

        Ok(())
    }

    async fn remove_docker_user_rule(&self, worker: &Worker) -> Result<()> {
        let supernet = self.supernet.to_string();
        self.runner
            .run(
                worker,
                "iptables",
                &[
                    "-D",
                    "DOCKER-USER",
                    "-s",
                    &supernet,
                    "-d",
                    &supernet,
                    "-j",
                    "ACCEPT",
                    "-m",
                    "comment",
                    "--comment",
                    DOCKER_USER_COMMENT,
                ],
            )
            .await?;
        Ok(())
    }

    async fn ensure_masquerade_rule(&self, worker: &Worker) -> Result<()> {
        let subnet = worker
            .overlay_subnet
            .map(|s| s.to_string())
            .unwrap_or_else(|| self.supernet.to_string());

        let check = self
            .runner
            .run(
                worker,
                "iptables",
                &[
                    "-t", "nat", "-C", "POSTROUTING", "-s", &subnet, "-o", &self.egress_interface, "-j",
                    "MASQUERADE", "-m", "comment", "--comment", MASQUERADE_COMMENT,
                ],
            )
            .await?;

        if check.success() {
            return Ok(());
        }

        self.runner
            .run(
                worker,
                "iptables",
                &[
                    "-t", "nat", "-A", "POSTROUTING", "-s", &subnet, "-o", &self.egress_interface, "-j",
                    "MASQUERADE", "-m", "comment", "--comment", MASQUERADE_COMMENT,
                ],
            )
            .await?;

        Ok(())
    }

    async fn remove_masquerade_rule(&self, worker: &Worker) -> Result<()> {
        let subnet = worker
            .overlay_subnet
            .map(|s| s.to_string())
            .unwrap_or_else(|| self.supernet.to_string());

        self.runner
            .run(
                worker,
                "iptables",
                &[
                    "-t", "nat", "-D", "POSTROUTING", "-s", &subnet, "-o", &self.egress_interface, "-j",
                    "MASQUERADE", "-m", "comment", "--comment", MASQUERADE_COMMENT,
                ],
            )
            .await?;
        Ok(())
    }
}

fn overlay_network_name(worker: &Worker) -> String {
    format!("netsatbench-{}", worker.name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use netsat_model::Node;

    fn worker(name: &str, ip: &str) -> Worker {
        Worker {
            name: name.to_owned(),
            ssh_user: "root".to_owned(),
            ip: ip.to_owned(),
            ssh_key: "/root/.ssh/id_ed25519".to_owned(),
            overlay_subnet: Some(Ipv4Network::new(Ipv4Addr::new(172, 1, 0, 0), 16).unwrap()),
        }
    }

    #[tokio::test]
    async fn prepare_worker_installs_a_route_per_peer() {
        let runner = RecordingRemoteRunner::new();
        let orchestrator = WorkerOrchestrator::new(runner.clone(), "netsatbench/node:latest", "etcd:2379");

        let w1 = worker("w1", "10.0.0.1");
        let w2 = worker("w2", "10.0.0.2");

        orchestrator.prepare_worker(&w1, &[w1.clone(), w2.clone()]).await.unwrap();

        let invocations = runner.invocations.lock();
        assert!(invocations
            .iter()
            .any(|(_, program, args)| program == "ip" && args.contains(&"10.0.0.2".to_owned())));
    }

    #[tokio::test]
    async fn teardown_continues_past_a_failing_step() {
        struct AlwaysFails;

        #[async_trait::async_trait]
        impl RemoteRunner for AlwaysFails {
            async fn run(&self, _worker: &Worker, _program: &str, _args: &[&str]) -> Result<netsat_command::CommandOutput> {
                anyhow::bail!("connection refused")
            }
        }

        let orchestrator = WorkerOrchestrator::new(Arc::new(AlwaysFails), "img", "etcd:2379");
        let w1 = worker("w1", "10.0.0.1");
        let node = Node::new("sat1", "satellite", "w1", 1);

        let summary = orchestrator.teardown_worker(&w1, &[node]).await;
        assert_eq!(summary.failures.len(), 3);
    }
}
