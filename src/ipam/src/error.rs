use std::net::IpAddr;

use ipnet::IpNet;
use podipam_trace::error::TraceableError;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Range exhausted: no free address in {start}-{end}")]
    RangeExhausted { start: IpAddr, end: IpAddr },

    #[error("Protocol mismatch")]
    ProtocolMismatch,

    #[error("Network {0} too small to allocate from")]
    SubnetTooSmall(IpNet),

    #[error("Network {0} has host bits set")]
    HostBitsSet(IpNet),

    #[error("{addr} not in network {subnet}")]
    NotInSubnet { addr: IpAddr, subnet: IpNet },

    #[error("Invalid range: {start} is after {end}")]
    InvalidRange { start: IpAddr, end: IpAddr },

    #[error("Excluded subnet {0} does not match the range family")]
    ExcludeMismatch(IpNet),

    #[error("{0} is outside of the range or excluded")]
    OutOfRange(IpAddr),

    #[error("{0} is already allocated")]
    AddressInUse(IpAddr),
}

impl TraceableError for Error {
    fn metric_label(&self) -> String {
        match self {
            Error::RangeExhausted { .. } => "range_exhausted",
            Error::ProtocolMismatch => "protocol_mismatch",
            Error::SubnetTooSmall(_) => "subnet_too_small",
            Error::HostBitsSet(_) => "host_bits_set",
            Error::NotInSubnet { .. } => "not_in_subnet",
            Error::InvalidRange { .. } => "invalid_range",
            Error::ExcludeMismatch(_) => "exclude_mismatch",
            Error::OutOfRange(_) => "out_of_range",
            Error::AddressInUse(_) => "address_in_use",
        }
        .to_string()
    }
}
