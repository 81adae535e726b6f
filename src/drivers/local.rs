// src/drivers/local.rs

//! Drivers running experiment applications as shell commands on this host.
//!
//! - [`LocalNode`] stands for the machine itself. Discovery only checks a
//!   `hostname` filter against it; it is ready as soon as it is deployed.
//! - [`LocalApplication`] runs `sh -c <command>` once its node is READY,
//!   capturing stdout and stderr as traces under the controller's run
//!   directory. It becomes FINISHED when the process exits with status 0
//!   and FAILED otherwise.

use std::fs::{self, File};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, anyhow};
use tracing::{debug, info, warn};

use crate::engine::ControllerHandle;
use crate::errors::{ExpctlError, Result};
use crate::exec::TimeSpec;
use crate::resource::{
    AttrType, AttrValue, Attribute, Filters, Flags, Progress, ResourceCore, ResourceFactory,
    ResourceManager, ResourceType, TraceOutput, TraceQuery, TraceSpec, read_trace_file,
};
use crate::types::{Guid, ResourceState};

/// Factory with every local driver registered.
pub fn factory() -> ResourceFactory {
    let mut factory = ResourceFactory::new();
    factory.register::<LocalNode>().register::<LocalApplication>();
    factory
}

/// The local host.
#[derive(Debug)]
pub struct LocalNode {
    core: ResourceCore,
}

impl ResourceManager for LocalNode {
    fn core(&self) -> &ResourceCore {
        &self.core
    }

    fn discover(&self, _ctx: &ControllerHandle, filters: &Filters) -> anyhow::Result<Progress> {
        let wanted = filters.get("hostname").and_then(AttrValue::as_str);
        let hostname = self.core.attr_string("hostname").unwrap_or_default();
        match wanted {
            Some(wanted) if wanted != hostname => Ok(Progress::Blocked(format!(
                "no local host named '{wanted}' (this one is '{hostname}')"
            ))),
            _ => Ok(Progress::Done),
        }
    }
}

impl ResourceType for LocalNode {
    const RTYPE: &'static str = "local::Node";

    fn help() -> &'static str {
        "The host the controller runs on"
    }

    fn attributes() -> Vec<Attribute> {
        vec![
            Attribute::new("hostname", "Name of the host")
                .with_default("localhost")
                .with_flags(Flags::EXEC_READ_ONLY),
        ]
    }

    fn new(core: ResourceCore) -> Self {
        Self { core }
    }
}

/// A shell command run on the local host.
#[derive(Debug)]
pub struct LocalApplication {
    core: ResourceCore,
    process: Arc<Mutex<Option<Child>>>,
    outputs: Mutex<Option<PathBuf>>,
}

impl LocalApplication {
    fn run_dir(&self) -> Option<PathBuf> {
        self.outputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn kill(&self) -> anyhow::Result<()> {
        let mut process = self.process.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(mut child) = process.take() {
            if child.try_wait()?.is_none() {
                debug!(guid = self.core.guid(), pid = child.id(), "killing process");
                child.kill().context("killing application process")?;
            }
            child.wait().context("reaping application process")?;
        }
        Ok(())
    }
}

impl ResourceManager for LocalApplication {
    fn core(&self) -> &ResourceCore {
        &self.core
    }

    fn valid_connection(&self, ctx: &ControllerHandle, guid: Guid) -> bool {
        ctx.resource(guid)
            .is_ok_and(|rm| rm.rtype() == LocalNode::RTYPE)
    }

    fn deploy(&self, ctx: &ControllerHandle) -> anyhow::Result<Progress> {
        let guid = self.core.guid();
        if ctx.connected(guid, Some(LocalNode::RTYPE)).is_empty() {
            return Ok(Progress::Blocked("application is not connected to a node".to_string()));
        }

        let node = ctx.await_connected(guid, LocalNode::RTYPE, ResourceState::Ready);
        if !node.is_done() {
            return Ok(node);
        }

        if self.core.attr_string("command").is_none_or(|c| c.trim().is_empty()) {
            return Ok(Progress::Blocked("attribute 'command' is not set".to_string()));
        }

        let dir = ctx.run_dir(guid);
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating run directory {:?}", dir))?;
        *self.outputs.lock().unwrap_or_else(PoisonError::into_inner) = Some(dir);

        Ok(Progress::Done)
    }

    fn start(&self, ctx: &ControllerHandle) -> anyhow::Result<Progress> {
        let guid = self.core.guid();
        let command = self
            .core
            .attr_string("command")
            .ok_or_else(|| anyhow!("attribute 'command' is not set"))?;
        let dir = self
            .run_dir()
            .ok_or_else(|| anyhow!("application was not deployed"))?;

        let stdout = File::create(dir.join("stdout"))
            .with_context(|| format!("creating stdout file in {:?}", dir))?;
        let stderr = File::create(dir.join("stderr"))
            .with_context(|| format!("creating stderr file in {:?}", dir))?;

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&command)
            .current_dir(&dir)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);
        if let Some(env) = self.core.attr_string("env") {
            for pair in env.split_whitespace() {
                if let Some((key, value)) = pair.split_once('=') {
                    cmd.env(key, value);
                }
            }
        }

        let child = cmd
            .spawn()
            .with_context(|| format!("spawning '{}' for application {}", command, guid))?;
        info!(guid, pid = child.id(), cmd = %command, "application process started");
        *self.process.lock().unwrap_or_else(PoisonError::into_inner) = Some(child);

        schedule_watch(ctx, guid, Arc::clone(&self.process))?;
        Ok(Progress::Done)
    }

    fn stop(&self, _ctx: &ControllerHandle) -> anyhow::Result<()> {
        self.kill()
    }

    fn release(&self, _ctx: &ControllerHandle) -> anyhow::Result<()> {
        self.kill()
    }

    fn trace(&self, name: &str, query: TraceQuery) -> Result<TraceOutput> {
        let dir = self.run_dir().ok_or_else(|| ExpctlError::TraceUnavailable {
            name: name.to_string(),
            reason: "application was never deployed".to_string(),
        })?;
        let path = dir.join(name);
        if query != TraceQuery::Path && !path.exists() {
            return Err(ExpctlError::TraceUnavailable {
                name: name.to_string(),
                reason: "application has not produced it yet".to_string(),
            });
        }
        Ok(read_trace_file(&path, query)?)
    }
}

impl ResourceType for LocalApplication {
    const RTYPE: &'static str = "local::Application";

    fn help() -> &'static str {
        "Runs a shell command on the local host"
    }

    fn attributes() -> Vec<Attribute> {
        vec![
            Attribute::new("command", "Command line passed to `sh -c`")
                .with_flags(Flags::EXEC_READ_ONLY),
            Attribute::new("env", "Space-separated KEY=VALUE pairs added to the environment")
                .with_type(AttrType::String)
                .with_flags(Flags::EXEC_READ_ONLY),
        ]
    }

    fn traces() -> Vec<TraceSpec> {
        vec![
            TraceSpec::new("stdout", "Standard output of the command"),
            TraceSpec::new("stderr", "Standard error of the command"),
        ]
    }

    fn new(core: ResourceCore) -> Self {
        Self {
            core,
            process: Arc::new(Mutex::new(None)),
            outputs: Mutex::new(None),
        }
    }
}

fn schedule_watch(
    ctx: &ControllerHandle,
    guid: Guid,
    process: Arc<Mutex<Option<Child>>>,
) -> Result<()> {
    let interval = ctx.config().poll_interval;
    ctx.schedule(
        TimeSpec::After(interval),
        format!("watch process guid={guid}"),
        move |ctx| watch_process(ctx, guid, process),
    )?;
    Ok(())
}

/// Poll the application process; finish or fail the resource once it exits.
fn watch_process(
    ctx: &ControllerHandle,
    guid: Guid,
    process: Arc<Mutex<Option<Child>>>,
) -> anyhow::Result<()> {
    let state = ctx.state(guid)?;
    match state {
        // start() returned but the controller has not recorded it yet.
        ResourceState::Ready => {
            schedule_watch(ctx, guid, process)?;
            return Ok(());
        }
        ResourceState::Started => {}
        _ => return Ok(()),
    }

    let status = {
        let mut slot = process.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.as_mut() {
            Some(child) => child.try_wait().context("polling application process")?,
            None => return Ok(()),
        }
    };

    match status {
        None => schedule_watch(ctx, guid, process)?,
        Some(status) if status.success() => {
            info!(guid, "application finished");
            ctx.resource(guid)?.core().finish();
        }
        Some(status) => {
            warn!(guid, %status, "application exited with an error");
            ctx.fail(guid, format!("process exited with {status}"));
        }
    }
    Ok(())
}
