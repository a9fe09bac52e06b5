use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{
    command,
    shaper::{GroupId, Platform, Shaper},
    shaping::Shaping,
    target::Target,
    Error, Result,
};

/// A call received by [`FakeShaper`].
#[derive(Debug, Clone, PartialEq)]
pub enum ShaperCall {
    /// [`Shaper::initialize`].
    Initialize,
    /// [`Shaper::create_group`].
    CreateGroup(GroupId, Target),
    /// [`Shaper::join_group`].
    JoinGroup(GroupId, Target),
    /// [`Shaper::leave_group`].
    LeaveGroup(GroupId, Target),
    /// [`Shaper::shape`].
    Shape(GroupId, Shaping),
    /// [`Shaper::unshape`].
    Unshape(GroupId),
}

impl ShaperCall {
    /// The operation name, as used by [`FakeShaper::fail_on`].
    pub const fn op(&self) -> &'static str {
        match self {
            Self::Initialize => "initialize",
            Self::CreateGroup(..) => "create group",
            Self::JoinGroup(..) => "join group",
            Self::LeaveGroup(..) => "leave group",
            Self::Shape(..) => "shape",
            Self::Unshape(..) => "unshape",
        }
    }
}

/// A shaper that touches no kernel state.
///
/// [`FakeShaper::new`] records every call and is meant as a test double. Long-running dry runs
/// on hosts without the required privileges use [`FakeShaper::dry_run`], which keeps nothing.
#[derive(Debug)]
pub struct FakeShaper {
    recording: bool,
    calls: Mutex<Vec<ShaperCall>>,
    failing: Mutex<Vec<&'static str>>,
}

impl Default for FakeShaper {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeShaper {
    /// A shaper recording every call it receives.
    pub fn new() -> Self {
        Self { recording: true, calls: Mutex::default(), failing: Mutex::default() }
    }

    /// A shaper that accepts every call and records none of them.
    pub fn dry_run() -> Self {
        Self { recording: false, ..Self::new() }
    }

    /// Makes every subsequent call of operation `op` (see [`ShaperCall::op`]) fail.
    pub fn fail_on(&self, op: &'static str) {
        self.failing.lock().push(op);
    }

    /// Stops injecting failures.
    pub fn heal(&self) {
        self.failing.lock().clear();
    }

    /// The calls received so far, failed ones included. Always empty for a dry run.
    pub fn calls(&self) -> Vec<ShaperCall> {
        self.calls.lock().clone()
    }

    /// Forgets the recorded calls.
    pub fn clear(&self) {
        self.calls.lock().clear();
    }

    fn record(&self, call: ShaperCall) -> Result<()> {
        let op = call.op();
        if self.recording {
            self.calls.lock().push(call);
        }

        if self.failing.lock().contains(&op) {
            return Err(Error::Command {
                op,
                on: "fake".to_owned(),
                source: command::Error::Io(std::io::Error::other("injected failure")),
            });
        }

        Ok(())
    }
}

#[async_trait]
impl Shaper for FakeShaper {
    fn platform(&self) -> Platform {
        Platform::Fake
    }

    async fn initialize(&self) -> Result<()> {
        self.record(ShaperCall::Initialize)
    }

    async fn create_group(&self, id: GroupId, target: &Target) -> Result<()> {
        self.record(ShaperCall::CreateGroup(id, *target))
    }

    async fn join_group(&self, id: GroupId, target: &Target) -> Result<()> {
        self.record(ShaperCall::JoinGroup(id, *target))
    }

    async fn leave_group(&self, id: GroupId, target: &Target) -> Result<()> {
        self.record(ShaperCall::LeaveGroup(id, *target))
    }

    async fn shape(&self, id: GroupId, shaping: &Shaping) -> Result<()> {
        self.record(ShaperCall::Shape(id, shaping.clone()))
    }

    async fn unshape(&self, id: GroupId) -> Result<()> {
        self.record(ShaperCall::Unshape(id))
    }
}
