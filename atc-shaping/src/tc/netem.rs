//! Netem (network emulator) leaf qdisc.
//!
//! Netem is attached under a group's HTB class and adds the configured delay, jitter, loss,
//! reordering and corruption to every packet of that class.

use std::fmt::Display;

use super::handle::TcRequestInner;
use crate::shaping::LinkShaping;

/// A netem qdisc built from one direction of a shaping profile.
#[derive(Debug, Clone)]
pub struct QdiscNetemRequest {
    /// Device and parent class.
    pub inner: TcRequestInner,
    /// The emulated conditions.
    pub link: LinkShaping,
}

impl QdiscNetemRequest {
    /// A netem qdisc emulating `link` under `inner.parent`.
    pub fn new(inner: TcRequestInner, link: &LinkShaping) -> Self {
        Self { inner, link: link.clone() }
    }

    /// `qdisc add dev <dev> parent 1:<id> netem [delay ..] [loss ..] [reorder ..] [corrupt ..]`
    ///
    /// Parameters left at zero are omitted, so an all-zero profile yields a pass-through netem.
    pub fn build(&self) -> Vec<String> {
        let mut args = self.inner.args("qdisc", "add");
        args.push("netem".to_owned());

        let delay = &self.link.delay;
        if delay.delay > 0 || delay.jitter > 0 {
            args.extend(["delay".to_owned(), format!("{}ms", delay.delay)]);
            // Correlation is positional and only valid after a jitter.
            if delay.jitter > 0 {
                args.push(format!("{}ms", delay.jitter));
                push_percent(&mut args, delay.correlation);
            }
        }

        let loss = &self.link.loss;
        if loss.percentage > 0.0 {
            args.extend(["loss".to_owned(), percent(loss.percentage)]);
            push_percent(&mut args, loss.correlation);
        }

        let reorder = &self.link.reorder;
        if reorder.percentage > 0.0 {
            args.extend(["reorder".to_owned(), percent(reorder.percentage)]);
            push_percent(&mut args, reorder.correlation);
            if reorder.gap > 0 {
                args.extend(["gap".to_owned(), reorder.gap.to_string()]);
            }
        }

        let corruption = &self.link.corruption;
        if corruption.percentage > 0.0 {
            args.extend(["corrupt".to_owned(), percent(corruption.percentage)]);
            push_percent(&mut args, corruption.correlation);
        }

        args
    }
}

fn percent(value: impl Display) -> String {
    format!("{value}%")
}

fn push_percent(args: &mut Vec<String>, value: f64) {
    if value > 0.0 {
        args.push(percent(value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        shaping::{Corruption, Delay, Loss, Reorder},
        tc::handle::Handle,
    };

    fn request(link: &LinkShaping) -> String {
        let inner = TcRequestInner::new("eth0").with_parent(Handle::new(1, 5));
        QdiscNetemRequest::new(inner, link).build().join(" ")
    }

    #[test]
    fn full_profile() {
        let link = LinkShaping {
            rate: 1_000,
            delay: Delay { delay: 10, jitter: 15, correlation: 1.0 },
            loss: Loss { percentage: 10.0, correlation: 6.3 },
            reorder: Reorder { percentage: 6.0, gap: 1, correlation: 0.6 },
            corruption: Corruption { percentage: 3.4, correlation: 0.0 },
        };

        assert_eq!(
            request(&link),
            "qdisc add dev eth0 parent 1:5 netem delay 10ms 15ms 1% loss 10% 6.3% \
             reorder 6% 0.6% gap 1 corrupt 3.4%"
        );
    }

    #[test]
    fn empty_profile_is_pass_through() {
        assert_eq!(request(&LinkShaping::default()), "qdisc add dev eth0 parent 1:5 netem");
    }

    #[test]
    fn delay_correlation_needs_jitter() {
        let link = LinkShaping {
            delay: Delay { delay: 20, jitter: 0, correlation: 50.0 },
            ..Default::default()
        };
        assert_eq!(request(&link), "qdisc add dev eth0 parent 1:5 netem delay 20ms");
    }
}
