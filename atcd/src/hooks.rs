//! User-configured commands run on group events and on a timer.
//!
//! Every hook owns a lock, so concurrent events never run the same hook twice at once. Distinct
//! hooks are independent of each other.

use std::{io, process::Stdio, sync::Arc, time::Duration};

use atc_shaping::{command::Output, GroupId, Target};
use serde::{Deserialize, Serialize};
use tokio::{sync::Mutex, task::JoinHandle, time::MissedTickBehavior};

use crate::config::ConfigError;

/// Events a hook can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookTrigger {
    /// A member joined a group, or a group was created.
    Join,
    /// A member left a group.
    Leave,
    /// Fires on every periodic tick.
    Periodic,
}

impl HookTrigger {
    /// The name used in configuration files and in `ATC_HOOK_TYPE`.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Join => "group.join",
            Self::Leave => "group.leave",
            Self::Periodic => "periodic",
        }
    }

    /// Parses a trigger name. `never` is valid and attaches to nothing.
    fn parse(hook: &str, name: &str) -> Result<Option<Self>, ConfigError> {
        match name {
            "group.join" => Ok(Some(Self::Join)),
            "group.leave" => Ok(Some(Self::Leave)),
            "periodic" => Ok(Some(Self::Periodic)),
            "never" => Ok(None),
            _ => Err(ConfigError::UnknownTrigger {
                hook: hook.to_owned(),
                trigger: name.to_owned(),
            }),
        }
    }
}

/// A hook as written in the configuration document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookConfig {
    /// Name used in logs and errors.
    pub name: String,
    /// Trigger names, see [`HookTrigger::as_str`]. `never` disables the hook.
    #[serde(default)]
    pub when: Vec<String>,
    /// Program to execute.
    pub command: String,
    /// Arguments passed before the event arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Run detached; the triggering operation does not wait.
    #[serde(default, rename = "async")]
    pub run_async: bool,
    /// Fail the triggering operation if the hook fails.
    #[serde(default)]
    pub success_required: bool,
}

/// How a hook's outcome affects the operation that triggered it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookMode {
    /// Spawned in the background, failures are only logged.
    Detached,
    /// Awaited, failures fail the operation.
    Required,
    /// Awaited, failures are only logged.
    BestEffort,
}

/// Failure of a hook whose result is awaited.
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    /// The process could not be started.
    #[error("hook {name:?} could not be started: {source}")]
    Spawn {
        /// The hook.
        name: String,
        /// Why the process could not be started.
        #[source]
        source: io::Error,
    },
    /// The process exited unsuccessfully.
    #[error("hook {name:?} exited with status {:?}", output.status)]
    Failed {
        /// The hook.
        name: String,
        /// Exit status and captured output.
        output: Output,
    },
}

/// Environment and arguments of one hook run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invocation {
    /// Variables added to the environment.
    pub env: Vec<(String, String)>,
    /// Arguments appended after the configured ones.
    pub args: Vec<String>,
}

/// A validated hook.
#[derive(Debug)]
pub struct Hook {
    name: String,
    triggers: Vec<HookTrigger>,
    command: String,
    args: Vec<String>,
    mode: HookMode,
    lock: Mutex<()>,
}

impl Hook {
    /// Validates `config`. Unknown triggers and an empty command are rejected.
    pub fn from_config(config: &HookConfig) -> Result<Self, ConfigError> {
        let mode = match (config.run_async, config.success_required) {
            (true, true) => return Err(ConfigError::AsyncAndRequired(config.name.clone())),
            (true, false) => HookMode::Detached,
            (false, true) => HookMode::Required,
            (false, false) => HookMode::BestEffort,
        };

        if config.command.trim().is_empty() {
            return Err(ConfigError::EmptyCommand(config.name.clone()));
        }

        let mut triggers = Vec::with_capacity(config.when.len());
        for name in &config.when {
            if let Some(trigger) = HookTrigger::parse(&config.name, name)? {
                triggers.push(trigger);
            }
        }

        Ok(Self {
            name: config.name.clone(),
            triggers,
            command: config.command.clone(),
            args: config.args.clone(),
            mode,
            lock: Mutex::new(()),
        })
    }

    /// The configured name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// How the result of a run is handled.
    pub const fn mode(&self) -> HookMode {
        self.mode
    }

    /// Whether the hook is attached to `trigger`.
    pub fn fires_on(&self, trigger: HookTrigger) -> bool {
        self.triggers.contains(&trigger)
    }

    /// Runs the hook according to its [`HookMode`].
    pub async fn run(self: &Arc<Self>, invocation: Invocation) -> Result<(), HookError> {
        match self.mode {
            HookMode::Detached => {
                let hook = Arc::clone(self);
                tokio::spawn(async move {
                    let _ = hook.execute(&invocation).await;
                });
                Ok(())
            }
            HookMode::Required => self.execute(&invocation).await,
            HookMode::BestEffort => {
                let _ = self.execute(&invocation).await;
                Ok(())
            }
        }
    }

    /// Runs the command to completion under the hook's lock. Failures are logged.
    async fn execute(&self, invocation: &Invocation) -> Result<(), HookError> {
        let _guard = self.lock.lock().await;

        tracing::debug!(
            hook = %self.name,
            command = %self.command,
            args = ?invocation.args,
            "running hook"
        );

        let output: Output = tokio::process::Command::new(&self.command)
            .args(&self.args)
            .args(&invocation.args)
            .envs(invocation.env.iter().map(|(key, value)| (key, value)))
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| {
                tracing::warn!(hook = %self.name, error = %source, "hook could not be started");
                HookError::Spawn { name: self.name.clone(), source }
            })?
            .into();

        if !output.success() {
            tracing::warn!(
                hook = %self.name,
                status = ?output.status,
                stdout = output.stdout.trim(),
                stderr = output.stderr.trim(),
                "hook failed"
            );
            return Err(HookError::Failed { name: self.name.clone(), output });
        }

        Ok(())
    }
}

/// Dispatches events to the hooks attached to them.
#[derive(Debug, Default)]
pub struct HookRunner {
    hooks: Vec<Arc<Hook>>,
    daemon_addr: Option<String>,
}

impl HookRunner {
    /// A runner over `hooks`, kept in order.
    pub fn new(hooks: Vec<Hook>) -> Self {
        Self { hooks: hooks.into_iter().map(Arc::new).collect(), daemon_addr: None }
    }

    /// Exports `addr` to every hook as `ATCD_ADDR`.
    pub fn with_daemon_addr(mut self, addr: Option<String>) -> Self {
        self.daemon_addr = addr;
        self
    }

    /// Whether any hook is attached to [`HookTrigger::Periodic`].
    pub fn has_periodic(&self) -> bool {
        self.hooks.iter().any(|hook| hook.fires_on(HookTrigger::Periodic))
    }

    fn invocation(&self, trigger: HookTrigger, group: Option<(GroupId, &Target)>) -> Invocation {
        let mut invocation = Invocation::default();
        invocation.env.push(("ATC_HOOK_TYPE".to_owned(), trigger.as_str().to_owned()));
        if let Some(addr) = &self.daemon_addr {
            invocation.env.push(("ATCD_ADDR".to_owned(), addr.clone()));
        }

        if let Some((id, member)) = group {
            invocation.env.push(("ATC_GROUP_ID".to_owned(), id.to_string()));
            invocation.env.push(("ATC_MEMBER".to_owned(), member.to_string()));
            invocation.args = vec![id.to_string(), member.to_string()];
        }

        invocation
    }

    async fn dispatch(
        &self,
        trigger: HookTrigger,
        group: Option<(GroupId, &Target)>,
    ) -> Result<(), HookError> {
        let invocation = self.invocation(trigger, group);
        for hook in self.hooks.iter().filter(|hook| hook.fires_on(trigger)) {
            hook.run(invocation.clone()).await?;
        }
        Ok(())
    }

    /// Runs the hooks attached to a group event. Fails on the first required hook that fails.
    pub async fn fire(
        &self,
        trigger: HookTrigger,
        id: GroupId,
        member: &Target,
    ) -> Result<(), HookError> {
        self.dispatch(trigger, Some((id, member))).await
    }

    /// Runs the periodic hooks once, without group context.
    pub async fn fire_periodic(&self) {
        if let Err(e) = self.dispatch(HookTrigger::Periodic, None).await {
            tracing::warn!(error = %e, "periodic hook failed");
        }
    }

    /// Fires the periodic hooks every `resolution`, starting now. `None` if there are none.
    pub fn spawn_periodic(self: &Arc<Self>, resolution: Duration) -> Option<JoinHandle<()>> {
        if !self.has_periodic() {
            return None;
        }

        let runner = Arc::clone(self);
        let resolution = resolution.max(Duration::from_secs(1));
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(resolution);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                runner.fire_periodic().await;
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn scratch() -> PathBuf {
        std::env::temp_dir().join(format!("atcd-hook-{}", rand::random::<u64>()))
    }

    fn shell(name: &str, when: &[&str], script: String) -> HookConfig {
        HookConfig {
            name: name.to_owned(),
            when: when.iter().map(|w| (*w).to_owned()).collect(),
            command: "sh".to_owned(),
            args: vec!["-c".to_owned(), script],
            run_async: false,
            success_required: true,
        }
    }

    fn runner(configs: &[HookConfig]) -> HookRunner {
        let _ = tracing_subscriber::fmt::try_init();
        HookRunner::new(configs.iter().map(|c| Hook::from_config(c).unwrap()).collect())
    }

    fn member() -> Target {
        "1.2.3.4".parse().unwrap()
    }

    #[tokio::test]
    async fn group_hooks_get_env_and_args() {
        let out = scratch();
        let script = format!(
            "echo \"$ATC_HOOK_TYPE $ATC_GROUP_ID $ATC_MEMBER $ATCD_ADDR $0 $1\" > {}",
            out.display()
        );
        let runner = runner(&[shell("env", &["group.join"], script)])
            .with_daemon_addr(Some("127.0.0.1:9090".to_owned()));

        runner.fire(HookTrigger::Join, 5, &member()).await.unwrap();

        let written = std::fs::read_to_string(&out).unwrap();
        assert_eq!(written.trim(), "group.join 5 1.2.3.4 127.0.0.1:9090 5 1.2.3.4");
        let _ = std::fs::remove_file(out);
    }

    #[tokio::test]
    async fn hooks_only_fire_on_their_triggers() {
        let out = scratch();
        let hook = shell("leave", &["group.leave", "never"], format!("touch {}", out.display()));
        let runner = runner(&[hook]);

        runner.fire(HookTrigger::Join, 1, &member()).await.unwrap();
        assert!(!out.exists());

        runner.fire(HookTrigger::Leave, 1, &member()).await.unwrap();
        assert!(out.exists());
        let _ = std::fs::remove_file(out);
    }

    #[tokio::test]
    async fn failure_modes() {
        let mut required = shell("required", &["group.join"], "exit 3".to_owned());
        let err =
            runner(&[required.clone()]).fire(HookTrigger::Join, 1, &member()).await.unwrap_err();
        assert!(matches!(err, HookError::Failed { ref output, .. } if output.status == Some(3)));

        required.success_required = false;
        runner(&[required.clone()]).fire(HookTrigger::Join, 1, &member()).await.unwrap();

        required.run_async = true;
        runner(&[required]).fire(HookTrigger::Join, 1, &member()).await.unwrap();
    }

    #[tokio::test]
    async fn missing_program_fails_required_hook() {
        let config = HookConfig {
            name: "missing".to_owned(),
            when: vec!["group.join".to_owned()],
            command: "/nonexistent/atcd-hook".to_owned(),
            args: Vec::new(),
            run_async: false,
            success_required: true,
        };

        let err = runner(&[config]).fire(HookTrigger::Join, 1, &member()).await.unwrap_err();
        assert!(matches!(err, HookError::Spawn { ref name, .. } if name == "missing"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn same_hook_never_overlaps() {
        let out = scratch();
        let path = out.display();
        let script = format!("echo start >> {path}; sleep 0.2; echo end >> {path}");
        let runner = runner(&[shell("serial", &["group.join"], script)]);

        let (m1, m2) = (member(), member());
        let (a, b) = tokio::join!(
            runner.fire(HookTrigger::Join, 1, &m1),
            runner.fire(HookTrigger::Join, 2, &m2),
        );
        a.unwrap();
        b.unwrap();

        let written = std::fs::read_to_string(&out).unwrap();
        assert_eq!(written, "start\nend\nstart\nend\n");
        let _ = std::fs::remove_file(out);
    }

    #[tokio::test]
    async fn periodic_hooks_start_immediately_without_group() {
        let out = scratch();
        let script = format!("echo \"$ATC_HOOK_TYPE:$ATC_GROUP_ID:$#\" >> {}", out.display());
        let runner = Arc::new(runner(&[shell("tick", &["periodic"], script)]));

        let handle = runner.spawn_periodic(Duration::from_secs(60)).unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        handle.abort();

        let written = std::fs::read_to_string(&out).unwrap();
        assert_eq!(written, "periodic::0\n");
        let _ = std::fs::remove_file(out);
    }

    #[test]
    fn no_periodic_task_without_periodic_hooks() {
        let runner = runner(&[shell("join", &["group.join"], "true".to_owned())]);
        assert!(!runner.has_periodic());
    }
}
