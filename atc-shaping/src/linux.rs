use std::sync::Arc;

use async_trait::async_trait;
use tracing::Instrument;

use crate::{
    command::{self, Executor, Output, SystemExecutor},
    iptables::{Family, IpTables, Rule, RuleSpec},
    shaper::{GroupId, Platform, Shaper},
    shaping::{LinkShaping, Shaping},
    target::Target,
    tc::{
        core::{effective_rate_kbit, police_burst_bytes, POLICE_MTU},
        filter::{FwFilterRequest, Police, PolicerAction, Protocol},
        handle::{group_class, group_mark, TcRequestInner},
        htb::{HtbClassRequest, QdiscHtbRequest},
        netem::QdiscNetemRequest,
    },
    Error, Result,
};

const MANGLE: &str = "mangle";
const FORWARD: &str = "FORWARD";

/// `tc` diagnostics meaning the object to remove was never there.
const ABSENT_MARKERS: [&str; 5] = [
    "No such file or directory",
    "Cannot delete qdisc with handle of zero",
    "Cannot find specified filter chain",
    "not found",
    "doesn't exist",
];

fn is_absent(output: &Output) -> bool {
    ABSENT_MARKERS.iter().any(|marker| output.stderr.contains(marker))
}

/// Options for [`LinuxShaper`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinuxShaperOptions {
    /// Interface facing the upstream network; carries the `up` direction.
    pub wan: String,
    /// Interface facing the shaped clients; carries the `down` direction.
    pub lan: String,
    /// Path of the `iptables` binary.
    pub iptables: String,
    /// Path of the `ip6tables` binary.
    pub ip6tables: String,
    /// Path of the `tc` binary.
    pub tc: String,
    /// What happens to traffic exceeding a group's rate.
    pub policer: PolicerAction,
}

impl Default for LinuxShaperOptions {
    fn default() -> Self {
        Self {
            wan: "eth0".to_owned(),
            lan: "eth1".to_owned(),
            iptables: "iptables".to_owned(),
            ip6tables: "ip6tables".to_owned(),
            tc: "tc".to_owned(),
            policer: PolicerAction::Drop,
        }
    }
}

impl LinuxShaperOptions {
    /// Sets the upstream interface.
    pub fn with_wan(mut self, wan: impl Into<String>) -> Self {
        self.wan = wan.into();
        self
    }

    /// Sets the client-facing interface.
    pub fn with_lan(mut self, lan: impl Into<String>) -> Self {
        self.lan = lan.into();
        self
    }

    /// Sets the path of the `iptables` binary.
    pub fn with_iptables(mut self, path: impl Into<String>) -> Self {
        self.iptables = path.into();
        self
    }

    /// Sets the path of the `ip6tables` binary.
    pub fn with_ip6tables(mut self, path: impl Into<String>) -> Self {
        self.ip6tables = path.into();
        self
    }

    /// Sets the path of the `tc` binary.
    pub fn with_tc(mut self, path: impl Into<String>) -> Self {
        self.tc = path.into();
        self
    }

    /// Sets what happens to traffic exceeding a group's rate.
    pub const fn with_policer(mut self, policer: PolicerAction) -> Self {
        self.policer = policer;
        self
    }
}

/// Shapes traffic forwarded between a WAN and a LAN interface.
///
/// Group membership is expressed as `MARK` rules in the `mangle/FORWARD` chain, profiles as an
/// HTB class, fw filters and a netem leaf per interface.
#[derive(Debug)]
pub struct LinuxShaper<E = SystemExecutor> {
    options: LinuxShaperOptions,
    executor: Arc<E>,
    v4: IpTables<E>,
    v6: IpTables<E>,
}

impl LinuxShaper {
    /// Creates a shaper running its commands on the host.
    pub fn new(options: LinuxShaperOptions) -> Self {
        Self::with_executor(options, SystemExecutor)
    }
}

impl<E: Executor> LinuxShaper<E> {
    /// Creates a shaper issuing its commands through `executor`.
    pub fn with_executor(options: LinuxShaperOptions, executor: E) -> Self {
        let executor = Arc::new(executor);
        let v4 = IpTables::new(options.iptables.clone(), Family::V4, Arc::clone(&executor));
        let v6 = IpTables::new(options.ip6tables.clone(), Family::V6, Arc::clone(&executor));
        Self { options, executor, v4, v6 }
    }

    /// The options the shaper was created with.
    pub const fn options(&self) -> &LinuxShaperOptions {
        &self.options
    }

    const fn tables(&self, target: &Target) -> &IpTables<E> {
        match Family::of(target) {
            Family::V4 => &self.v4,
            Family::V6 => &self.v6,
        }
    }

    /// The two marking rules of a member: inbound towards it on WAN, outbound from it on LAN.
    fn mark_rules(&self, id: GroupId, target: &Target) -> Result<[RuleSpec; 2]> {
        let mark = GroupId::from(group_mark(id)?);
        Ok([
            RuleSpec::mark(mark).with_destination(*target).with_input(&self.options.wan),
            RuleSpec::mark(mark).with_source(*target).with_input(&self.options.lan),
        ])
    }

    async fn mark(&self, id: GroupId, target: &Target) -> Result<()> {
        let chain = self.tables(target).chain(MANGLE, FORWARD);
        for rule in self.mark_rules(id, target)? {
            chain.append(&rule).await.map_err(|source| Error::Command {
                op: "mark packets",
                on: chain.to_string(),
                source,
            })?;
        }

        tracing::debug!(id, %target, "marking rules installed");
        Ok(())
    }

    /// Reads back the marking rules installed for `target`.
    pub async fn installed_rules(&self, target: &Target) -> Result<Vec<Rule>> {
        self.tables(target).chain(MANGLE, FORWARD).rules(Some(target)).await
    }

    async fn tc(&self, op: &'static str, device: &str, args: Vec<String>) -> Result<()> {
        self.executor.run(&self.options.tc, &args).await.map(drop).map_err(|source| {
            Error::Command { op, on: device.to_owned(), source }
        })
    }

    /// Like [`Self::tc`], but removing something that is not there is fine.
    async fn tc_remove(&self, op: &'static str, device: &str, args: Vec<String>) -> Result<()> {
        match self.executor.run(&self.options.tc, &args).await {
            Ok(_) => Ok(()),
            Err(command::Error::NonZero(ref output)) if is_absent(output) => {
                tracing::debug!(op, device, stderr = output.stderr.trim(), "nothing to remove");
                Ok(())
            }
            Err(source) => Err(Error::Command { op, on: device.to_owned(), source }),
        }
    }

    async fn init_interface(&self, device: &str) -> Result<()> {
        let root = QdiscHtbRequest::new(TcRequestInner::new(device));
        self.tc_remove("delete root qdisc", device, root.delete()).await?;
        self.tc("install htb root qdisc", device, root.build()).await
    }

    async fn shape_on(&self, device: &str, id: GroupId, link: &LinkShaping) -> Result<()> {
        let class_id = group_class(id)?;
        let mark = group_mark(id)?;

        let class = HtbClassRequest::new(device, class_id).with_rate(link.rate);
        self.tc("create class", device, class.build()).await?;

        let police = Police {
            rate_kbit: effective_rate_kbit(link.rate),
            burst_bytes: police_burst_bytes(link.rate, link.delay.delay),
            mtu: POLICE_MTU,
            action: self.options.policer,
        };
        for protocol in Protocol::ALL {
            let filter = FwFilterRequest::new(device, protocol, mark)
                .with_class_id(class_id)
                .with_police(police);
            self.tc("create filter", device, filter.build()).await?;
        }

        let netem = QdiscNetemRequest::new(TcRequestInner::new(device).with_parent(class_id), link);
        self.tc("create netem qdisc", device, netem.build()).await?;

        tracing::debug!(id, device, rate = link.rate, "class shaped");
        Ok(())
    }

    /// Filters go first, the class cannot be deleted while they reference it.
    async fn unshape_on(&self, device: &str, id: GroupId) -> Result<()> {
        let class_id = group_class(id)?;
        let mark = group_mark(id)?;

        for protocol in Protocol::ALL {
            let filter = FwFilterRequest::new(device, protocol, mark);
            self.tc_remove("delete filter", device, filter.delete()).await?;
        }

        let class = HtbClassRequest::new(device, class_id);
        self.tc_remove("delete class", device, class.delete()).await
    }

    fn directions<'a>(&'a self, shaping: &'a Shaping) -> [(&'a str, Option<&'a LinkShaping>); 2] {
        [
            (self.options.wan.as_str(), shaping.up.as_ref()),
            (self.options.lan.as_str(), shaping.down.as_ref()),
        ]
    }
}

#[async_trait]
impl<E: Executor> Shaper for LinuxShaper<E> {
    fn platform(&self) -> Platform {
        Platform::Linux
    }

    async fn initialize(&self) -> Result<()> {
        for tables in [&self.v4, &self.v6] {
            let chain = tables.chain(MANGLE, FORWARD);
            chain.flush().await.map_err(|source| Error::Command {
                op: "flush marking rules",
                on: chain.to_string(),
                source,
            })?;
        }

        for device in [&self.options.wan, &self.options.lan] {
            self.init_interface(device)
                .instrument(tracing::debug_span!("initialize", interface = %device))
                .await?;
        }

        tracing::info!(wan = %self.options.wan, lan = %self.options.lan, "shaper initialized");
        Ok(())
    }

    async fn create_group(&self, id: GroupId, target: &Target) -> Result<()> {
        self.mark(id, target).await
    }

    async fn join_group(&self, id: GroupId, target: &Target) -> Result<()> {
        self.mark(id, target).await
    }

    async fn leave_group(&self, id: GroupId, target: &Target) -> Result<()> {
        let chain = self.tables(target).chain(MANGLE, FORWARD);
        for rule in self.mark_rules(id, target)? {
            chain.delete(&rule).await.map_err(|source| Error::Command {
                op: "unmark packets",
                on: chain.to_string(),
                source,
            })?;
        }

        tracing::debug!(id, %target, "marking rules removed");
        Ok(())
    }

    async fn shape(&self, id: GroupId, shaping: &Shaping) -> Result<()> {
        for (device, link) in self.directions(shaping) {
            let span = tracing::debug_span!("shape", id, interface = %device);
            async {
                self.unshape_on(device, id).await?;
                match link {
                    Some(link) => self.shape_on(device, id, link).await,
                    None => Ok(()),
                }
            }
            .instrument(span)
            .await?;
        }

        Ok(())
    }

    async fn unshape(&self, id: GroupId) -> Result<()> {
        for device in [&self.options.wan, &self.options.lan] {
            self.unshape_on(device, id)
                .instrument(tracing::debug_span!("unshape", id, interface = %device))
                .await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        command::testing::RecordingExecutor,
        shaping::{Delay, Loss},
    };

    fn shaper() -> LinuxShaper<RecordingExecutor> {
        let _ = tracing_subscriber::fmt::try_init();
        LinuxShaper::with_executor(LinuxShaperOptions::default(), RecordingExecutor::default())
    }

    fn target(s: &str) -> Target {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn initialize_flushes_and_installs_roots() {
        let shaper = shaper();
        let absent = Output::failed(2, "Error: Cannot delete qdisc with handle of zero.");
        shaper.executor.respond("tc qdisc del dev eth1", absent);

        shaper.initialize().await.unwrap();

        assert_eq!(
            shaper.executor.calls(),
            vec![
                "iptables -t mangle -F FORWARD",
                "ip6tables -t mangle -F FORWARD",
                "tc qdisc del dev eth0 root",
                "tc qdisc add dev eth0 root handle 1: htb",
                "tc qdisc del dev eth1 root",
                "tc qdisc add dev eth1 root handle 1: htb",
            ]
        );
    }

    #[tokio::test]
    async fn join_and_leave_are_inverse() {
        let shaper = shaper();
        shaper.join_group(3, &target("1.2.3.4")).await.unwrap();
        shaper.leave_group(3, &target("1.2.3.4")).await.unwrap();
        shaper.create_group(4, &target("2001:db8::/64")).await.unwrap();

        assert_eq!(
            shaper.executor.calls(),
            vec![
                "iptables -t mangle -A FORWARD -d 1.2.3.4 -i eth0 -j MARK --set-xmark 0x3/0xffffffff",
                "iptables -t mangle -A FORWARD -s 1.2.3.4 -i eth1 -j MARK --set-xmark 0x3/0xffffffff",
                "iptables -t mangle -D FORWARD -d 1.2.3.4 -i eth0 -j MARK --set-xmark 0x3/0xffffffff",
                "iptables -t mangle -D FORWARD -s 1.2.3.4 -i eth1 -j MARK --set-xmark 0x3/0xffffffff",
                "ip6tables -t mangle -A FORWARD -d 2001:db8::/64 -i eth0 -j MARK --set-xmark 0x4/0xffffffff",
                "ip6tables -t mangle -A FORWARD -s 2001:db8::/64 -i eth1 -j MARK --set-xmark 0x4/0xffffffff",
            ]
        );
    }

    #[tokio::test]
    async fn shape_unshapes_first_and_shapes_each_direction() {
        let shaper = shaper();
        let shaping = Shaping {
            up: Some(LinkShaping {
                rate: 8_000,
                delay: Delay { delay: 100, jitter: 0, correlation: 0.0 },
                ..Default::default()
            }),
            down: Some(LinkShaping {
                loss: Loss { percentage: 5.0, correlation: 0.0 },
                ..Default::default()
            }),
        };

        shaper.shape(10, &shaping).await.unwrap();

        let unshape = |dev: &str| {
            vec![
                format!("tc filter del dev {dev} parent 1: protocol ip prio 1 handle 0xa fw"),
                format!("tc filter del dev {dev} parent 1: protocol ipv6 prio 2 handle 0xa fw"),
                format!("tc class del dev {dev} parent 1: classid 1:a"),
            ]
        };

        let mut expected = unshape("eth0");
        expected.extend([
            "tc class add dev eth0 parent 1: classid 1:a htb rate 8000kbit ceil 8000kbit".to_owned(),
            "tc filter add dev eth0 parent 1: protocol ip prio 1 handle 0xa fw classid 1:a police rate 8000kbit burst 100000 mtu 2048 drop".to_owned(),
            "tc filter add dev eth0 parent 1: protocol ipv6 prio 2 handle 0xa fw classid 1:a police rate 8000kbit burst 100000 mtu 2048 drop".to_owned(),
            "tc qdisc add dev eth0 parent 1:a netem delay 100ms".to_owned(),
        ]);
        expected.extend(unshape("eth1"));
        expected.extend([
            "tc class add dev eth1 parent 1: classid 1:a htb rate 34359738kbit ceil 34359738kbit".to_owned(),
            "tc filter add dev eth1 parent 1: protocol ip prio 1 handle 0xa fw classid 1:a police rate 34359738kbit burst 15000 mtu 2048 drop".to_owned(),
            "tc filter add dev eth1 parent 1: protocol ipv6 prio 2 handle 0xa fw classid 1:a police rate 34359738kbit burst 15000 mtu 2048 drop".to_owned(),
            "tc qdisc add dev eth1 parent 1:a netem loss 5%".to_owned(),
        ]);

        assert_eq!(shaper.executor.calls(), expected);
    }

    #[tokio::test]
    async fn missing_direction_is_left_unshaped() {
        let shaper = LinuxShaper::with_executor(
            LinuxShaperOptions::default().with_policer(PolicerAction::Pass),
            RecordingExecutor::default(),
        );
        let shaping =
            Shaping { up: None, down: Some(LinkShaping { rate: 64, ..Default::default() }) };

        shaper.shape(2, &shaping).await.unwrap();

        let calls = shaper.executor.calls();
        assert!(calls.iter().all(|call| !call.contains("add dev eth0")));
        assert!(calls.iter().any(|call| call.ends_with("burst 15000 mtu 2048 pass")));
    }

    #[tokio::test]
    async fn unshape_tolerates_absent_objects() {
        let shaper = shaper();
        shaper.executor.respond(
            "tc filter del",
            Output::failed(2, "Error: Filter with specified priority/protocol not found."),
        );
        let missing = Output::failed(2, "RTNETLINK answers: No such file or directory");
        shaper.executor.respond("tc class del", missing);

        shaper.unshape(7).await.unwrap();
        assert_eq!(shaper.executor.calls().len(), 6);
    }

    #[tokio::test]
    async fn failures_carry_operation_and_interface() {
        let shaper = shaper();
        let missing = Output::failed(2, "Cannot find device \"eth0\"");
        shaper.executor.respond("tc class add dev eth0", missing);

        let err = shaper
            .shape(1, &Shaping { up: Some(LinkShaping::default()), down: None })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Command { op: "create class", ref on, .. } if on == "eth0"));
        assert!(err.to_string().starts_with("create class on eth0 failed"));
    }

    #[tokio::test]
    async fn invalid_ids_issue_no_commands() {
        let shaper = shaper();
        assert!(matches!(
            shaper.join_group(0x1_0000, &target("1.2.3.4")).await,
            Err(Error::InvalidGroupId(0x1_0000))
        ));
        assert!(shaper.executor.calls().is_empty());
    }

    #[tokio::test]
    async fn installed_rules_reads_back_marks() {
        let shaper = shaper();
        shaper.executor.respond(
            "iptables -t mangle -nvxL FORWARD --line-numbers",
            Output {
                status: Some(0),
                stdout: "Chain FORWARD (policy ACCEPT 0 packets, 0 bytes)\n\
                         num pkts bytes target prot opt in out source destination\n\
                         1 5 420 MARK all -- eth0 * 0.0.0.0/0 1.2.3.4 MARK xset 0x3/0xffffffff\n\
                         2 7 580 MARK all -- eth1 * 1.2.3.4 0.0.0.0/0 MARK xset 0x3/0xffffffff\n\
                         3 0 0 MARK all -- eth0 * 0.0.0.0/0 5.6.7.8 MARK xset 0x4/0xffffffff\n"
                    .to_owned(),
                stderr: String::new(),
            },
        );

        let rules = shaper.installed_rules(&target("1.2.3.4")).await.unwrap();
        assert_eq!(rules.iter().map(|rule| rule.index).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(rules[1].input, "eth1");
        assert_eq!(rules[1].packets, 7);
    }
}
