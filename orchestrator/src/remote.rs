use anyhow::{Context, Result};
use async_trait::async_trait;
use netsat_command::CommandOutput;
use netsat_model::Worker;
use openssh::{KnownHosts, Session};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// §4.3: "authenticated, strict host-key checking disabled on first use".
#[async_trait]
pub trait RemoteRunner: Send + Sync {
    async fn run(&self, worker: &Worker, program: &str, args: &[&str]) -> Result<CommandOutput>;
}

/// Runs commands over SSH, caching one [`Session`] per worker host.
#[derive(Default)]
pub struct SshRunner {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl SshRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    async fn session_for(&self, worker: &Worker) -> Result<Arc<Session>> {
        if let Some(session) = self.sessions.lock().get(&worker.name).cloned() {
            return Ok(session);
        }

        let destination = format!("{}@{}", worker.ssh_user, worker.ip);
        let session = Session::connect_mux(&destination, KnownHosts::Accept)
            .await
            .with_context(|| format!("failed to SSH to worker {}", worker.name))?;
        let session = Arc::new(session);

        self.sessions.lock().insert(worker.name.clone(), session.clone());
        Ok(session)
    }
}

#[async_trait]
impl RemoteRunner for SshRunner {
    async fn run(&self, worker: &Worker, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let session = self.session_for(worker).await?;

        let mut cmd = session.command(program);
        cmd.args(args);

        let output = cmd
            .output()
            .await
            .with_context(|| format!("`{program}` failed on worker {}", worker.name))?;

        Ok(CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Test double: records every `(worker, program, args)` triple instead of
/// touching the network.
#[derive(Default)]
pub struct RecordingRemoteRunner {
    pub invocations: Mutex<Vec<(String, String, Vec<String>)>>,
}

impl RecordingRemoteRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl RemoteRunner for RecordingRemoteRunner {
    async fn run(&self, worker: &Worker, program: &str, args: &[&str]) -> Result<CommandOutput> {
        self.invocations.lock().push((
            worker.name.clone(),
            program.to_owned(),
            args.iter().map(|a| a.to_string()).collect(),
        ));
        Ok(CommandOutput::default())
    }
}
