//! Driver for the `iptables`/`ip6tables` command line tools.

use std::{fmt, sync::Arc};

use crate::{
    command::{self, Executor},
    shaper::GroupId,
    target::Target,
};

mod rule;
pub use rule::{parse_listing, Family, ParseRuleError, Rule};

/// A rule to append to or delete from a chain.
///
/// Appending and deleting the same spec are exact inverses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSpec {
    source: Option<Target>,
    destination: Option<Target>,
    input: Option<String>,
    jump: String,
    jump_args: Vec<String>,
}

impl RuleSpec {
    /// A rule that tags matching packets with the firewall mark of group `id`.
    pub fn mark(id: GroupId) -> Self {
        Self {
            source: None,
            destination: None,
            input: None,
            jump: "MARK".to_owned(),
            jump_args: vec!["--set-xmark".to_owned(), format!("{id:#x}/0xffffffff")],
        }
    }

    /// Matches packets from `source` (`-s`).
    pub fn with_source(mut self, source: Target) -> Self {
        self.source = Some(source);
        self
    }

    /// Matches packets to `destination` (`-d`).
    pub fn with_destination(mut self, destination: Target) -> Self {
        self.destination = Some(destination);
        self
    }

    /// Matches packets received on `interface` (`-i`).
    pub fn with_input(mut self, interface: impl Into<String>) -> Self {
        self.input = Some(interface.into());
        self
    }

    fn push_args(&self, args: &mut Vec<String>) {
        if let Some(source) = &self.source {
            args.extend(["-s".to_owned(), source.to_string()]);
        }
        if let Some(destination) = &self.destination {
            args.extend(["-d".to_owned(), destination.to_string()]);
        }
        if let Some(input) = &self.input {
            args.extend(["-i".to_owned(), input.clone()]);
        }
        args.extend(["-j".to_owned(), self.jump.clone()]);
        args.extend(self.jump_args.iter().cloned());
    }
}

/// One firewall binary (`iptables` or `ip6tables`) and the executor used to run it.
#[derive(Debug)]
pub struct IpTables<E> {
    program: String,
    family: Family,
    executor: Arc<E>,
}

impl<E: Executor> IpTables<E> {
    /// Drives `program`, which manages the tables of `family`.
    pub fn new(program: impl Into<String>, family: Family, executor: Arc<E>) -> Self {
        Self { program: program.into(), family, executor }
    }

    /// The address family of the managed tables.
    pub const fn family(&self) -> Family {
        self.family
    }

    /// The firewall binary.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// A handle on `chain` of `table`.
    pub const fn chain(&self, table: &'static str, chain: &'static str) -> Chain<'_, E> {
        Chain { tables: self, table, name: chain }
    }
}

/// A chain of a table, e.g. `mangle/FORWARD`.
#[derive(Debug)]
pub struct Chain<'a, E> {
    tables: &'a IpTables<E>,
    table: &'static str,
    name: &'static str,
}

impl<E: Executor> Chain<'_, E> {
    fn base_args(&self, op: &str) -> Vec<String> {
        vec!["-t".to_owned(), self.table.to_owned(), op.to_owned(), self.name.to_owned()]
    }

    async fn run(&self, args: Vec<String>) -> command::Result<command::Output> {
        self.tables.executor.run(&self.tables.program, &args).await
    }

    /// Appends `rule` to the end of the chain (`-A`).
    pub async fn append(&self, rule: &RuleSpec) -> command::Result<()> {
        let mut args = self.base_args("-A");
        rule.push_args(&mut args);
        self.run(args).await.map(drop)
    }

    /// Deletes the first rule matching `rule` (`-D`).
    pub async fn delete(&self, rule: &RuleSpec) -> command::Result<()> {
        let mut args = self.base_args("-D");
        rule.push_args(&mut args);
        self.run(args).await.map(drop)
    }

    /// Deletes every rule of the chain (`-F`).
    pub async fn flush(&self) -> command::Result<()> {
        self.run(self.base_args("-F")).await.map(drop)
    }

    /// Lists the installed rules, keeping only those involving `filter` when given.
    pub async fn rules(&self, filter: Option<&Target>) -> crate::Result<Vec<Rule>> {
        let mut args = self.base_args("-nvxL");
        args.push("--line-numbers".to_owned());

        let output = self.run(args).await.map_err(|source| crate::Error::Command {
            op: "list rules",
            on: self.to_string(),
            source,
        })?;

        let mut rules = parse_listing(&output.stdout, self.tables.family)?;
        if let Some(target) = filter {
            rules.retain(|rule| rule.involves(target));
        }

        Ok(rules)
    }
}

impl<E> fmt::Display for Chain<'_, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.tables.program, self.table, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{testing::RecordingExecutor, Output};

    #[tokio::test]
    async fn append_and_delete_are_inverse() {
        let executor = Arc::new(RecordingExecutor::default());
        let tables = IpTables::new("iptables", Family::V4, executor.clone());
        let chain = tables.chain("mangle", "FORWARD");

        let rule = RuleSpec::mark(10)
            .with_destination("1.2.3.4".parse().unwrap())
            .with_input("eth0");
        chain.append(&rule).await.unwrap();
        chain.delete(&rule).await.unwrap();
        chain.flush().await.unwrap();

        assert_eq!(
            executor.calls(),
            vec![
                "iptables -t mangle -A FORWARD -d 1.2.3.4 -i eth0 -j MARK --set-xmark 0xa/0xffffffff",
                "iptables -t mangle -D FORWARD -d 1.2.3.4 -i eth0 -j MARK --set-xmark 0xa/0xffffffff",
                "iptables -t mangle -F FORWARD",
            ]
        );
    }

    #[tokio::test]
    async fn rules_are_filtered_by_target() {
        let executor = Arc::new(RecordingExecutor::default());
        executor.respond(
            "ip6tables -t mangle -nvxL FORWARD",
            Output {
                status: Some(0),
                stdout: "Chain FORWARD (policy ACCEPT)\n\
                         num pkts bytes target prot opt in out source destination\n\
                         1 0 0 MARK all eth0 * ::/0 2001:db8::1 MARK xset 0x3/0xffffffff\n\
                         2 0 0 MARK all eth0 * ::/0 2001:db8::2 MARK xset 0x4/0xffffffff\n"
                    .to_owned(),
                stderr: String::new(),
            },
        );

        let tables = IpTables::new("ip6tables", Family::V6, executor);
        let target: Target = "2001:db8::2".parse().unwrap();
        let rules = tables.chain("mangle", "FORWARD").rules(Some(&target)).await.unwrap();

        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].index, 2);
        assert_eq!(rules[0].destination, target);
    }
}
