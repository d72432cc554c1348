//! Port-list builder
//!
//! Expands a port specification into the ordered list of ports to try:
//! a service name from the local services database, an inclusive range
//! `lo-hi`, or a single literal port. Ranges may optionally be shuffled
//! for scanning.

use std::ffi::CString;

use rand::seq::SliceRandom;

use crate::config::SocketKind;
use crate::QanatError;

/// Expand a port specification into an ordered list of ports.
///
/// Resolution order mirrors netcat: a known service name wins, then a
/// range containing `-`, then a single literal port. With `randomize`
/// an expanded range is permuted with a uniform Fisher-Yates shuffle.
pub fn build_ports(spec: &str, kind: SocketKind, randomize: bool) -> Result<Vec<u16>, QanatError> {
    if let Some(port) = service_port(spec, kind.proto_name()) {
        return Ok(vec![port]);
    }

    if let Some((lo, hi)) = spec.split_once('-') {
        let a = parse_port(lo, spec)?;
        let b = parse_port(hi, spec)?;
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };

        let mut ports: Vec<u16> = (lo..=hi).collect();
        if randomize {
            ports.shuffle(&mut rand::thread_rng());
        }
        return Ok(ports);
    }

    Ok(vec![parse_port(spec, spec)?])
}

/// Parse a port specification that must name exactly one port.
///
/// Listen mode accepts a single port only; ranges are rejected here
/// before any socket work happens.
pub fn single_port(spec: &str, kind: SocketKind) -> Result<u16, QanatError> {
    if let Some(port) = service_port(spec, kind.proto_name()) {
        return Ok(port);
    }
    if spec.contains('-') {
        return Err(QanatError::InvalidPortSpec(format!(
            "{spec}: listen mode takes exactly one port"
        )));
    }
    parse_port(spec, spec)
}

fn parse_port(s: &str, spec: &str) -> Result<u16, QanatError> {
    match s.parse::<u16>() {
        Ok(p) if p >= 1 => Ok(p),
        _ => Err(QanatError::InvalidPortSpec(spec.to_string())),
    }
}

/// Look up a service name in the local services database.
///
/// Returns `None` for unknown names, including plain numeric strings.
pub fn service_port(name: &str, proto: &str) -> Option<u16> {
    let name = CString::new(name).ok()?;
    let proto = CString::new(proto).ok()?;
    let servent = unsafe { libc::getservbyname(name.as_ptr(), proto.as_ptr()) };
    if servent.is_null() {
        return None;
    }
    let raw_port = unsafe { (*servent).s_port };
    Some(u16::from_be(raw_port as u16))
}

/// Reverse service lookup for diagnostics.
pub fn service_name(port: u16, proto: &str) -> Option<String> {
    let proto = CString::new(proto).ok()?;
    let servent = unsafe { libc::getservbyport(libc::c_int::from(port.to_be()), proto.as_ptr()) };
    if servent.is_null() {
        return None;
    }
    let name = unsafe { std::ffi::CStr::from_ptr((*servent).s_name) };
    Some(name.to_string_lossy().into_owned())
}
