//! IP protocol number/name table
//!
//! The assignments follow the common /etc/protocols distribution file.

/// Well-known IP protocol assignments
static IP_PROTOCOLS: &[(u8, &str)] = &[
    (0, "HOPOPT"),
    (1, "ICMP"),
    (2, "IGMP"),
    (3, "GGP"),
    (4, "IP-ENCAP"),
    (5, "ST2"),
    (6, "TCP"),
    (7, "CBT"),
    (8, "EGP"),
    (9, "IGP"),
    (12, "PUP"),
    (17, "UDP"),
    (20, "HMP"),
    (22, "XNS-IDP"),
    (27, "RDP"),
    (29, "ISO-TP4"),
    (33, "DCCP"),
    (36, "XTP"),
    (37, "DDP"),
    (41, "IPV6"),
    (43, "IPV6-ROUTE"),
    (44, "IPV6-FRAG"),
    (45, "IDRP"),
    (46, "RSVP"),
    (47, "GRE"),
    (50, "ESP"),
    (51, "AH"),
    (57, "SKIP"),
    (58, "IPV6-ICMP"),
    (59, "IPV6-NONXT"),
    (60, "IPV6-OPTS"),
    (73, "CPHB"),
    (81, "VMTP"),
    (88, "EIGRP"),
    (89, "OSPFIGP"),
    (93, "AX.25"),
    (94, "IPIP"),
    (97, "ETHERIP"),
    (98, "ENCAP"),
    (103, "PIM"),
    (108, "IPCOMP"),
    (112, "CARP"),
    (115, "L2TP"),
    (124, "ISIS"),
    (132, "SCTP"),
    (133, "FC"),
    (135, "MOBILITY-HEADER"),
    (136, "UDPLITE"),
    (137, "MPLS-IN-IP"),
    (138, "MANET"),
    (139, "HIP"),
    (140, "SHIM6"),
    (141, "WESP"),
    (142, "ROHC"),
];

/// Name for a protocol number; unknown numbers are rendered as digits
pub fn proto_name(proto: u8) -> String {
    for (num, name) in IP_PROTOCOLS {
        if *num == proto {
            return (*name).to_string();
        }
    }
    proto.to_string()
}

/// Case-insensitive reverse lookup of a protocol name
pub fn proto_number(name: &str) -> Option<u8> {
    for (num, proto) in IP_PROTOCOLS {
        if proto.eq_ignore_ascii_case(name) {
            return Some(*num);
        }
    }
    None
}
