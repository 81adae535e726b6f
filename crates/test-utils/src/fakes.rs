//! In-memory drivers for exercising the controller without touching the
//! host.
//!
//! Every fake records its hook invocations in a shared [`Probe`] and takes
//! its behaviour from attributes:
//! - `deploy_delay` (seconds): deploy keeps reporting "not yet" this long
//! - `run_time` (seconds, applications only): finish this long after start;
//!   negative means run until stopped
//! - `fail_on`: `none` or the name of a hook (`discover`, `provision`,
//!   `deploy`, `start`, `stop`, `release`)
//! - `panic_on`: like `fail_on` but the hook panics

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::bail;

use expctl::engine::ControllerHandle;
use expctl::errors::{ExpctlError, Result};
use expctl::exec::TimeSpec;
use expctl::resource::{
    AttrType, Attribute, Filters, Flags, Progress, ResourceCore, ResourceFactory, ResourceManager,
    ResourceType, TraceOutput, TraceQuery, TraceSpec,
};
use expctl::types::{Guid, ResourceState};

/// One recorded hook invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub guid: Guid,
    pub hook: &'static str,
    pub at: Instant,
}

/// Shared log of hook invocations.
#[derive(Debug, Clone, Default)]
pub struct Probe {
    calls: Arc<Mutex<Vec<Call>>>,
}

impl Probe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, guid: Guid, hook: &'static str) {
        self.calls.lock().unwrap().push(Call {
            guid,
            hook,
            at: Instant::now(),
        });
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Guids in the order `hook` was invoked on them.
    pub fn order_of(&self, hook: &str) -> Vec<Guid> {
        self.calls()
            .into_iter()
            .filter(|c| c.hook == hook)
            .map(|c| c.guid)
            .collect()
    }

    pub fn count(&self, guid: Guid, hook: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.guid == guid && c.hook == hook)
            .count()
    }

    /// When `hook` was last invoked on `guid`.
    pub fn last(&self, guid: Guid, hook: &str) -> Option<Instant> {
        self.calls()
            .iter()
            .rev()
            .find(|c| c.guid == guid && c.hook == hook)
            .map(|c| c.at)
    }
}

/// Factory with all fakes registered against `probe`.
pub fn fake_factory(probe: &Probe) -> ResourceFactory {
    let mut factory = ResourceFactory::new();
    let (p1, p2, p3, p4) = (probe.clone(), probe.clone(), probe.clone(), probe.clone());
    factory
        .register_with::<FakeNode>(move |core| FakeNode {
            fake: Fake::new(core, p1.clone()),
        })
        .register_with::<FakeInterface>(move |core| FakeInterface {
            fake: Fake::new(core, p2.clone()),
        })
        .register_with::<FakeChannel>(move |core| FakeChannel {
            fake: Fake::new(core, p3.clone()),
        })
        .register_with::<FakeApplication>(move |core| FakeApplication {
            fake: Fake::new(core, p4.clone()),
        });
    factory
}

const HOOKS: &[&str] = &[
    "none", "discover", "provision", "deploy", "start", "stop", "release",
];

fn behaviour_attributes() -> Vec<Attribute> {
    vec![
        Attribute::new("deploy_delay", "Seconds before deploy completes")
            .with_type(AttrType::Double)
            .with_default(0.0),
        Attribute::new("fail_on", "Hook that returns an error")
            .with_allowed(HOOKS)
            .with_default("none"),
        Attribute::new("panic_on", "Hook that panics")
            .with_allowed(HOOKS)
            .with_default("none"),
    ]
}

/// Behaviour shared by every fake.
#[derive(Debug)]
struct Fake {
    core: ResourceCore,
    probe: Probe,
    deploying_since: Mutex<Option<Instant>>,
}

impl Fake {
    fn new(core: ResourceCore, probe: Probe) -> Self {
        Self {
            core,
            probe,
            deploying_since: Mutex::new(None),
        }
    }

    /// Record the call and apply `fail_on` / `panic_on`.
    fn enter(&self, hook: &'static str) -> anyhow::Result<()> {
        self.probe.record(self.core.guid(), hook);
        if self.core.attr_string("panic_on").as_deref() == Some(hook) {
            panic!("fake {hook} panic on guid {}", self.core.guid());
        }
        if self.core.attr_string("fail_on").as_deref() == Some(hook) {
            bail!("fake {hook} failure on guid {}", self.core.guid());
        }
        Ok(())
    }

    fn deploy(&self) -> anyhow::Result<Progress> {
        self.enter("deploy")?;
        let delay = self.core.attr_double("deploy_delay").unwrap_or(0.0);
        if delay > 0.0 {
            let since = *self
                .deploying_since
                .lock()
                .unwrap()
                .get_or_insert_with(Instant::now);
            let remaining = Duration::from_secs_f64(delay).saturating_sub(since.elapsed());
            if !remaining.is_zero() {
                return Ok(Progress::RetryAfter(remaining));
            }
        }
        Ok(Progress::Done)
    }

    /// Filters naming one of our attributes are taken as the value found.
    fn discover(&self, filters: &Filters) -> anyhow::Result<Progress> {
        self.enter("discover")?;
        for (name, value) in filters {
            if self.core.get(name).is_ok() {
                self.core.set_internal(name, value.clone())?;
            }
        }
        Ok(Progress::Done)
    }
}

macro_rules! fake_manager {
    () => {
        fn core(&self) -> &ResourceCore {
            &self.fake.core
        }

        fn discover(&self, _ctx: &ControllerHandle, filters: &Filters) -> anyhow::Result<Progress> {
            self.fake.discover(filters)
        }

        fn provision(&self, _ctx: &ControllerHandle, _filters: &Filters) -> anyhow::Result<Progress> {
            self.fake.enter("provision")?;
            Ok(Progress::Done)
        }

        fn stop(&self, _ctx: &ControllerHandle) -> anyhow::Result<()> {
            self.fake.enter("stop")
        }

        fn release(&self, _ctx: &ControllerHandle) -> anyhow::Result<()> {
            self.fake.enter("release")
        }
    };
}

/// A host.
#[derive(Debug)]
pub struct FakeNode {
    fake: Fake,
}

impl ResourceManager for FakeNode {
    fake_manager!();

    fn deploy(&self, _ctx: &ControllerHandle) -> anyhow::Result<Progress> {
        self.fake.deploy()
    }

    fn start(&self, _ctx: &ControllerHandle) -> anyhow::Result<Progress> {
        self.fake.enter("start")?;
        Ok(Progress::Done)
    }
}

impl ResourceType for FakeNode {
    const RTYPE: &'static str = "fake::Node";

    fn attributes() -> Vec<Attribute> {
        let mut attrs = behaviour_attributes();
        attrs.push(
            Attribute::new("hostname", "Host name")
                .with_default("fake-host")
                .with_flags(Flags::EXEC_READ_ONLY),
        );
        attrs
    }

    fn new(core: ResourceCore) -> Self {
        Self {
            fake: Fake::new(core, Probe::new()),
        }
    }
}

/// A network interface; connects a node to a channel.
#[derive(Debug)]
pub struct FakeInterface {
    fake: Fake,
}

impl ResourceManager for FakeInterface {
    fake_manager!();

    fn valid_connection(&self, ctx: &ControllerHandle, guid: Guid) -> bool {
        ctx.resource(guid)
            .is_ok_and(|rm| rm.rtype() == FakeNode::RTYPE || rm.rtype() == FakeChannel::RTYPE)
    }

    fn deploy(&self, ctx: &ControllerHandle) -> anyhow::Result<Progress> {
        let node = ctx.await_connected(self.fake.core.guid(), FakeNode::RTYPE, ResourceState::Ready);
        if !node.is_done() {
            return Ok(node);
        }
        self.fake.deploy()
    }

    fn start(&self, _ctx: &ControllerHandle) -> anyhow::Result<Progress> {
        self.fake.enter("start")?;
        Ok(Progress::Done)
    }
}

impl ResourceType for FakeInterface {
    const RTYPE: &'static str = "fake::Interface";

    fn attributes() -> Vec<Attribute> {
        let mut attrs = behaviour_attributes();
        attrs.push(
            Attribute::new("ip", "Address of the interface").with_flags(Flags::EXEC_READ_ONLY),
        );
        attrs
    }

    fn new(core: ResourceCore) -> Self {
        Self {
            fake: Fake::new(core, Probe::new()),
        }
    }
}

/// A link between interfaces.
#[derive(Debug)]
pub struct FakeChannel {
    fake: Fake,
}

impl ResourceManager for FakeChannel {
    fake_manager!();

    fn valid_connection(&self, ctx: &ControllerHandle, guid: Guid) -> bool {
        ctx.resource(guid)
            .is_ok_and(|rm| rm.rtype() == FakeInterface::RTYPE)
    }

    fn deploy(&self, ctx: &ControllerHandle) -> anyhow::Result<Progress> {
        let ifaces = ctx.await_connected(
            self.fake.core.guid(),
            FakeInterface::RTYPE,
            ResourceState::Ready,
        );
        if !ifaces.is_done() {
            return Ok(ifaces);
        }
        self.fake.deploy()
    }

    fn start(&self, _ctx: &ControllerHandle) -> anyhow::Result<Progress> {
        self.fake.enter("start")?;
        Ok(Progress::Done)
    }
}

impl ResourceType for FakeChannel {
    const RTYPE: &'static str = "fake::Channel";

    fn attributes() -> Vec<Attribute> {
        let mut attrs = behaviour_attributes();
        attrs.push(
            Attribute::new("loss", "Packet loss ratio")
                .with_type(AttrType::Double)
                .with_default(0.0),
        );
        attrs
    }

    fn new(core: ResourceCore) -> Self {
        Self {
            fake: Fake::new(core, Probe::new()),
        }
    }
}

/// An application that runs for `run_time` seconds once started.
#[derive(Debug)]
pub struct FakeApplication {
    fake: Fake,
}

impl FakeApplication {
    fn output(&self) -> String {
        format!("hello from {}\n", self.fake.core.guid())
    }
}

impl ResourceManager for FakeApplication {
    fake_manager!();

    fn deploy(&self, ctx: &ControllerHandle) -> anyhow::Result<Progress> {
        let guid = self.fake.core.guid();
        if !ctx.connected(guid, Some(FakeNode::RTYPE)).is_empty() {
            let node = ctx.await_connected(guid, FakeNode::RTYPE, ResourceState::Ready);
            if !node.is_done() {
                return Ok(node);
            }
        }
        self.fake.deploy()
    }

    fn start(&self, ctx: &ControllerHandle) -> anyhow::Result<Progress> {
        self.fake.enter("start")?;
        let run_time = self.fake.core.attr_double("run_time").unwrap_or(0.0);
        if run_time >= 0.0 {
            schedule_finish(ctx, self.fake.core.guid(), Duration::from_secs_f64(run_time))?;
        }
        Ok(Progress::Done)
    }

    fn trace(&self, name: &str, query: TraceQuery) -> Result<TraceOutput> {
        if self.fake.core.state() < ResourceState::Started {
            return Err(ExpctlError::TraceUnavailable {
                name: name.to_string(),
                reason: "application has not started".to_string(),
            });
        }
        let content = self.output().into_bytes();
        Ok(match query {
            TraceQuery::All => TraceOutput::Content(content),
            TraceQuery::Size => TraceOutput::Size(content.len() as u64),
            TraceQuery::Stream { block, offset } => {
                let start = (block * offset).min(content.len());
                let end = (start + block).min(content.len());
                TraceOutput::Content(content[start..end].to_vec())
            }
            TraceQuery::Path => {
                return Err(ExpctlError::TraceUnavailable {
                    name: name.to_string(),
                    reason: "kept in memory".to_string(),
                });
            }
        })
    }
}

impl ResourceType for FakeApplication {
    const RTYPE: &'static str = "fake::Application";

    fn attributes() -> Vec<Attribute> {
        let mut attrs = behaviour_attributes();
        attrs.push(
            Attribute::new("run_time", "Seconds until the application finishes")
                .with_type(AttrType::Double)
                .with_default(0.0)
                .with_flags(Flags::EXEC_READ_ONLY),
        );
        attrs.push(Attribute::new("rate", "Free-form runtime knob").with_type(AttrType::Integer));
        attrs
    }

    fn traces() -> Vec<TraceSpec> {
        vec![TraceSpec::new("stdout", "Greeting printed by the application")]
    }

    fn new(core: ResourceCore) -> Self {
        Self {
            fake: Fake::new(core, Probe::new()),
        }
    }
}

fn schedule_finish(ctx: &ControllerHandle, guid: Guid, after: Duration) -> Result<()> {
    ctx.schedule(TimeSpec::from(after), format!("finish guid={guid}"), move |ctx| {
        let rm = ctx.resource(guid)?;
        match rm.state() {
            // start() returned but STARTED is not recorded yet.
            ResourceState::Ready => schedule_finish(ctx, guid, Duration::from_millis(5))?,
            ResourceState::Started => {
                rm.core().finish();
            }
            _ => {}
        }
        Ok(())
    })?;
    Ok(())
}
