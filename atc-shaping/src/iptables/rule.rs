//! Parsing of `iptables -nvL --line-numbers` listings.
//!
//! A listing line has the columns
//!
//! ```text
//! num pkts bytes target prot opt in out source destination [args...]
//! ```
//!
//! `ip6tables` prints an empty `opt` column on some versions, which disappears once the line is
//! split on whitespace. [`Family`] decides which grammar applies to a line.

use std::str::FromStr;

use crate::target::Target;

/// Address family of a firewall table, which decides the listing grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    /// `iptables`: the `opt` column is always present.
    V4,
    /// `ip6tables`: the `opt` column may be elided.
    V6,
}

impl Family {
    /// The family whose table holds the rules of `target`.
    pub const fn of(target: &Target) -> Self {
        if target.is_ipv6() {
            Self::V6
        } else {
            Self::V4
        }
    }

    fn has_options_column(self, columns: &[&str]) -> bool {
        match self {
            Self::V4 => true,
            // Without `opt`, the eighth column is already the source address.
            Self::V6 => columns.get(7).map_or(true, |col| col.parse::<Target>().is_err()),
        }
    }
}

/// Why a listing line could not be read.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseRuleError {
    /// The line has fewer columns than the grammar needs (found, expected).
    #[error("rule has {0} columns, expected at least {1}")]
    TooShort(usize, usize),
    /// A column holds a value of the wrong shape.
    #[error("invalid {column} column: {value:?}")]
    Column {
        /// Header name of the column.
        column: &'static str,
        /// The raw value.
        value: String,
    },
}

/// One installed rule, as read back from the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    /// 1-based position in the chain.
    pub index: usize,
    /// Packets matched so far.
    pub packets: u64,
    /// Bytes matched so far.
    pub bytes: u64,
    /// The jump target, e.g. `MARK`.
    pub target: String,
    /// Matched protocol, `all` for any.
    pub protocol: String,
    /// The `opt` column, `None` where the listing elides it.
    pub options: Option<String>,
    /// Input interface, `*` for any.
    pub input: String,
    /// Output interface, `*` for any.
    pub output: String,
    /// Matched source network.
    pub source: Target,
    /// Matched destination network.
    pub destination: Target,
    /// Trailing action arguments, e.g. `["MARK", "set", "0x5"]`.
    pub args: Vec<String>,
}

impl Rule {
    /// Parses a single listing line using the grammar of `family`.
    pub fn parse(line: &str, family: Family) -> Result<Self, ParseRuleError> {
        let columns: Vec<&str> = line.split_whitespace().collect();

        let (options, rest) = if family.has_options_column(&columns) {
            (columns.get(5).map(|opt| (*opt).to_owned()), 6)
        } else {
            (None, 5)
        };

        let expected = rest + 4;
        if columns.len() < expected {
            return Err(ParseRuleError::TooShort(columns.len(), expected));
        }

        Ok(Self {
            index: parse_column("num", columns[0])?,
            packets: parse_counter("pkts", columns[1])?,
            bytes: parse_counter("bytes", columns[2])?,
            target: columns[3].to_owned(),
            protocol: columns[4].to_owned(),
            options,
            input: columns[rest].to_owned(),
            output: columns[rest + 1].to_owned(),
            source: parse_column("source", columns[rest + 2])?,
            destination: parse_column("destination", columns[rest + 3])?,
            args: columns[expected..].iter().map(|arg| (*arg).to_owned()).collect(),
        })
    }

    /// Whether the rule matches `target` as source or destination.
    pub fn involves(&self, target: &Target) -> bool {
        self.source == *target || self.destination == *target
    }
}

/// Parses a full listing, skipping the chain and column headers.
pub fn parse_listing(listing: &str, family: Family) -> Result<Vec<Rule>, ParseRuleError> {
    listing
        .lines()
        .skip(2)
        .filter(|line| !line.trim().is_empty())
        .map(|line| Rule::parse(line, family))
        .collect()
}

fn parse_column<T: FromStr>(column: &'static str, value: &str) -> Result<T, ParseRuleError> {
    value.parse().map_err(|_| ParseRuleError::Column { column, value: value.to_owned() })
}

/// Counters are exact with `-x`, otherwise scaled with a decimal `K`, `M`, `G` or `T` suffix.
fn parse_counter(column: &'static str, value: &str) -> Result<u64, ParseRuleError> {
    let (digits, scale) = match value.char_indices().last() {
        Some((at, 'K')) => (&value[..at], 1_000),
        Some((at, 'M')) => (&value[..at], 1_000_000),
        Some((at, 'G')) => (&value[..at], 1_000_000_000),
        Some((at, 'T')) => (&value[..at], 1_000_000_000_000),
        _ => (value, 1),
    };

    let count: u64 = parse_column(column, digits)?;
    count
        .checked_mul(scale)
        .ok_or_else(|| ParseRuleError::Column { column, value: value.to_owned() })
}

#[cfg(test)]
mod tests {
    use super::*;

    const V4_LISTING: &str = "\
Chain FORWARD (policy ACCEPT 0 packets, 0 bytes)
num      pkts      bytes target     prot opt in     out     source               destination
1          12     1024 MARK       all  --  eth0   *       0.0.0.0/0            1.2.3.4              MARK xset 0x5/0xffffffff
2         3K     9M MARK       all  --  eth1   *       1.2.3.4              0.0.0.0/0            MARK xset 0x5/0xffffffff
3           0        0 MARK       all  --  eth1   *       10.0.0.0/24          0.0.0.0/0            MARK xset 0x6/0xffffffff
";

    #[test]
    fn parse_v4_listing() {
        let rules = parse_listing(V4_LISTING, Family::V4).unwrap();
        assert_eq!(rules.len(), 3);

        let first = &rules[0];
        assert_eq!(first.index, 1);
        assert_eq!(first.packets, 12);
        assert_eq!(first.bytes, 1024);
        assert_eq!(first.target, "MARK");
        assert_eq!(first.protocol, "all");
        assert_eq!(first.options.as_deref(), Some("--"));
        assert_eq!(first.input, "eth0");
        assert_eq!(first.output, "*");
        assert_eq!(first.source.to_string(), "0.0.0.0/0");
        assert_eq!(first.destination.to_string(), "1.2.3.4");
        assert_eq!(first.args, vec!["MARK", "xset", "0x5/0xffffffff"]);

        assert_eq!(rules[1].packets, 3_000);
        assert_eq!(rules[1].bytes, 9_000_000);

        let target: Target = "1.2.3.4".parse().unwrap();
        let involved: Vec<_> =
            rules.iter().filter(|rule| rule.involves(&target)).map(|rule| rule.index).collect();
        assert_eq!(involved, vec![1, 2]);
    }

    #[test]
    fn parse_v6_with_and_without_options() {
        let elided = "1 4 320 MARK all eth0 * ::/0 2001:db8::1 MARK xset 0x7/0xffffffff";
        let rule = Rule::parse(elided, Family::V6).unwrap();
        assert_eq!(rule.options, None);
        assert_eq!(rule.input, "eth0");
        assert_eq!(rule.output, "*");
        assert_eq!(rule.source.to_string(), "::/0");
        assert_eq!(rule.destination.to_string(), "2001:db8::1");
        assert_eq!(rule.args, vec!["MARK", "xset", "0x7/0xffffffff"]);

        let full = "1 4 320 MARK all -- eth1 * 2001:db8::/64 ::/0 MARK xset 0x7/0xffffffff";
        let rule = Rule::parse(full, Family::V6).unwrap();
        assert_eq!(rule.options.as_deref(), Some("--"));
        assert_eq!(rule.input, "eth1");
        assert_eq!(rule.source.to_string(), "2001:db8::/64");
        assert_eq!(rule.destination.to_string(), "::/0");
    }

    #[test]
    fn parse_errors() {
        assert_eq!(
            Rule::parse("1 2 3 MARK all --", Family::V4),
            Err(ParseRuleError::TooShort(6, 10))
        );
        assert_eq!(
            Rule::parse("x 0 0 MARK all -- eth0 * 0.0.0.0/0 1.2.3.4", Family::V4),
            Err(ParseRuleError::Column { column: "num", value: "x".into() })
        );
        assert!(Rule::parse("1 0 0 MARK all -- eth0 * bogus 1.2.3.4", Family::V4).is_err());
    }

    #[test]
    fn oversized_counters_are_rejected() {
        let line = "1 0 99999999999T MARK all -- eth0 * 0.0.0.0/0 1.2.3.4";
        assert_eq!(
            Rule::parse(line, Family::V4),
            Err(ParseRuleError::Column { column: "bytes", value: "99999999999T".into() })
        );

        let rule = Rule::parse("1 18T 0 MARK all -- eth0 * 0.0.0.0/0 1.2.3.4", Family::V4).unwrap();
        assert_eq!(rule.packets, 18_000_000_000_000);
    }
}
