//! Condition tree nodes and evaluation

use crate::Val;
use std::cmp::Ordering;

/// Comparative operators recognized in conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompOp {
    Eq,
    Neq,
    Lt,
    Leq,
    Gt,
    Geq,
}

impl CompOp {
    fn holds(&self, ord: Ordering) -> bool {
        match self {
            CompOp::Eq => ord == Ordering::Equal,
            CompOp::Neq => ord != Ordering::Equal,
            CompOp::Lt => ord == Ordering::Less,
            CompOp::Leq => ord != Ordering::Greater,
            CompOp::Gt => ord == Ordering::Greater,
            CompOp::Geq => ord != Ordering::Less,
        }
    }

    /// True if the operator is an (in)equality test
    pub fn is_equality(&self) -> bool {
        matches!(self, CompOp::Eq | CompOp::Neq)
    }
}

/// Direction classification of a row, derived from its counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectionFilter {
    /// Traffic was only received
    In,
    /// Traffic was only sent
    Out,
    /// Traffic flowed in exactly one direction
    Uni,
    /// Traffic flowed in both directions
    Bi,
}

impl DirectionFilter {
    /// Check a row's counters against the filter
    pub fn matches(&self, val: &Val) -> bool {
        let rcvd = val.pkts_rcvd > 0 || val.bytes_rcvd > 0;
        let sent = val.pkts_sent > 0 || val.bytes_sent > 0;
        match self {
            DirectionFilter::In => rcvd && !sent,
            DirectionFilter::Out => sent && !rcvd,
            DirectionFilter::Uni => rcvd != sent,
            DirectionFilter::Bi => rcvd && sent,
        }
    }
}

/// A raw IP literal of either family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpLiteral {
    V4([u8; 4]),
    V6([u8; 16]),
}

impl IpLiteral {
    /// The literal's raw bytes
    pub fn bytes(&self) -> &[u8] {
        match self {
            IpLiteral::V4(b) => b,
            IpLiteral::V6(b) => b,
        }
    }
}

/// A network literal (address + prefix length)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetLiteral {
    pub addr: IpLiteral,
    pub prefix_len: u8,
}

impl NetLiteral {
    /// True if `raw` is an address of the same family inside the network
    pub fn contains(&self, raw: &[u8]) -> bool {
        let net = self.addr.bytes();
        if net.len() != raw.len() {
            return false;
        }

        let mut remaining = self.prefix_len as usize;
        for (a, b) in net.iter().zip(raw.iter()) {
            if remaining == 0 {
                return true;
            }
            let mask: u8 = if remaining >= 8 {
                0xff
            } else {
                !(0xff >> remaining)
            };
            if a & mask != b & mask {
                return false;
            }
            remaining = remaining.saturating_sub(8);
        }
        true
    }
}

/// A leaf predicate over one field of the flow schema
#[derive(Debug, Clone, PartialEq)]
pub enum Comparison {
    Sip { op: CompOp, addr: IpLiteral },
    Dip { op: CompOp, addr: IpLiteral },
    /// Either endpoint matches
    Host { op: CompOp, addr: IpLiteral },
    Snet { op: CompOp, net: NetLiteral },
    Dnet { op: CompOp, net: NetLiteral },
    /// Either endpoint's network matches
    Net { op: CompOp, net: NetLiteral },
    Dport { op: CompOp, port: u16 },
    Proto { op: CompOp, proto: u8 },
    Direction(DirectionFilter),
}

/// Borrowed view of one reconstructed row during a scan
#[derive(Debug, Clone, Copy)]
pub struct RowView<'a> {
    pub sip: &'a [u8],
    pub dip: &'a [u8],
    pub dport: u16,
    pub proto: u8,
    pub counters: &'a Val,
}

/// A condition tree
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
    Not(Box<Node>),
    Comparison(Comparison),
}

impl Node {
    /// Evaluate the tree against a row
    pub fn evaluate(&self, row: &RowView<'_>) -> bool {
        match self {
            Node::And(left, right) => left.evaluate(row) && right.evaluate(row),
            Node::Or(left, right) => left.evaluate(row) || right.evaluate(row),
            Node::Not(inner) => !inner.evaluate(row),
            Node::Comparison(cmp) => cmp.evaluate(row),
        }
    }

    /// Number of direction filters in the tree
    pub fn direction_filter_count(&self) -> usize {
        match self {
            Node::And(left, right) | Node::Or(left, right) => {
                left.direction_filter_count() + right.direction_filter_count()
            }
            Node::Not(inner) => inner.direction_filter_count(),
            Node::Comparison(Comparison::Direction(_)) => 1,
            Node::Comparison(_) => 0,
        }
    }
}

impl Comparison {
    fn evaluate(&self, row: &RowView<'_>) -> bool {
        match self {
            Comparison::Sip { op, addr } => ip_matches(*op, row.sip, addr),
            Comparison::Dip { op, addr } => ip_matches(*op, row.dip, addr),
            Comparison::Host { op, addr } => match op {
                // host != x means neither endpoint is x
                CompOp::Neq => {
                    ip_matches(CompOp::Neq, row.sip, addr)
                        && ip_matches(CompOp::Neq, row.dip, addr)
                }
                _ => ip_matches(*op, row.sip, addr) || ip_matches(*op, row.dip, addr),
            },
            Comparison::Snet { op, net } => net_matches(*op, row.sip, net),
            Comparison::Dnet { op, net } => net_matches(*op, row.dip, net),
            Comparison::Net { op, net } => match op {
                CompOp::Neq => {
                    net_matches(CompOp::Neq, row.sip, net)
                        && net_matches(CompOp::Neq, row.dip, net)
                }
                _ => net_matches(*op, row.sip, net) || net_matches(*op, row.dip, net),
            },
            Comparison::Dport { op, port } => op.holds(row.dport.cmp(port)),
            Comparison::Proto { op, proto } => op.holds(row.proto.cmp(proto)),
            Comparison::Direction(filter) => filter.matches(row.counters),
        }
    }
}

fn ip_matches(op: CompOp, raw: &[u8], lit: &IpLiteral) -> bool {
    let bytes = lit.bytes();
    if raw.len() != bytes.len() {
        // cross-family comparisons only satisfy inequality
        return op == CompOp::Neq;
    }
    op.holds(raw.cmp(bytes))
}

fn net_matches(op: CompOp, raw: &[u8], net: &NetLiteral) -> bool {
    match op {
        CompOp::Eq => net.contains(raw),
        CompOp::Neq => !net.contains(raw),
        // parser restricts nets to (in)equality
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row<'a>(sip: &'a [u8], dip: &'a [u8], dport: u16, proto: u8, val: &'a Val) -> RowView<'a> {
        RowView {
            sip,
            dip,
            dport,
            proto,
            counters: val,
        }
    }

    #[test]
    fn test_comparison_ops() {
        let val = Val::default();
        let r = row(&[1, 2, 3, 4], &[4, 5, 6, 7], 443, 6, &val);

        let eq = Node::Comparison(Comparison::Dport {
            op: CompOp::Eq,
            port: 443,
        });
        assert!(eq.evaluate(&r));

        let lt = Node::Comparison(Comparison::Dport {
            op: CompOp::Lt,
            port: 443,
        });
        assert!(!lt.evaluate(&r));

        let geq = Node::Comparison(Comparison::Proto {
            op: CompOp::Geq,
            proto: 6,
        });
        assert!(geq.evaluate(&r));
    }

    #[test]
    fn test_host_matches_either_side() {
        let val = Val::default();
        let r = row(&[1, 2, 3, 4], &[4, 5, 6, 7], 80, 6, &val);

        let lit = IpLiteral::V4([4, 5, 6, 7]);
        assert!(Node::Comparison(Comparison::Host {
            op: CompOp::Eq,
            addr: lit
        })
        .evaluate(&r));

        let other = IpLiteral::V4([9, 9, 9, 9]);
        assert!(Node::Comparison(Comparison::Host {
            op: CompOp::Neq,
            addr: other
        })
        .evaluate(&r));
        assert!(!Node::Comparison(Comparison::Host {
            op: CompOp::Neq,
            addr: lit
        })
        .evaluate(&r));
    }

    #[test]
    fn test_net_containment() {
        let net = NetLiteral {
            addr: IpLiteral::V4([10, 0, 0, 0]),
            prefix_len: 8,
        };
        assert!(net.contains(&[10, 1, 2, 3]));
        assert!(!net.contains(&[11, 1, 2, 3]));
        // family mismatch never matches
        assert!(!net.contains(&[0u8; 16]));

        let slash20 = NetLiteral {
            addr: IpLiteral::V4([192, 168, 16, 0]),
            prefix_len: 20,
        };
        assert!(slash20.contains(&[192, 168, 31, 255]));
        assert!(!slash20.contains(&[192, 168, 32, 0]));
    }

    #[test]
    fn test_direction_filter() {
        let in_only = Val {
            bytes_rcvd: 100,
            pkts_rcvd: 1,
            ..Val::default()
        };
        let both = Val {
            bytes_rcvd: 100,
            bytes_sent: 50,
            pkts_rcvd: 1,
            pkts_sent: 1,
        };

        assert!(DirectionFilter::In.matches(&in_only));
        assert!(DirectionFilter::Uni.matches(&in_only));
        assert!(!DirectionFilter::Bi.matches(&in_only));
        assert!(DirectionFilter::Bi.matches(&both));
        assert!(!DirectionFilter::Out.matches(&both));
    }

    #[test]
    fn test_boolean_composition() {
        let val = Val::default();
        let r = row(&[1, 2, 3, 4], &[4, 5, 6, 7], 22, 6, &val);

        let ssh_or_dns = Node::Or(
            Box::new(Node::Comparison(Comparison::Dport {
                op: CompOp::Eq,
                port: 22,
            })),
            Box::new(Node::Comparison(Comparison::Dport {
                op: CompOp::Eq,
                port: 53,
            })),
        );
        assert!(ssh_or_dns.evaluate(&r));

        let negated = Node::Not(Box::new(ssh_or_dns));
        assert!(!negated.evaluate(&r));
    }
}
