// Callback-driven I/O multiplexer for non-blocking TCP services.
//
// SPDX-License-Identifier: Apache-2.0
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except
// in compliance with the License. You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express
// or implied. See the License for the specific language governing permissions and limitations under
// the License.

//! IPv4/IPv6 endpoint value type and its sockaddr serialization.

use std::ffi::CString;
use std::fmt::{self, Display, Formatter, Write};
use std::mem;

use crate::status::{Error, Result};

const IPV4_ADDR_SIZE: usize = 4;
const IPV6_ADDR_SIZE: usize = 16;

extern "C" {
    fn inet_pton(af: libc::c_int, src: *const libc::c_char, dst: *mut libc::c_void) -> libc::c_int;
}

/// Address family of an [`InetAddress`].
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub enum Family {
    /// Unspecified; the family of a default-constructed address.
    #[default]
    Any,
    Ipv4,
    Ipv6,
}

/// An IP endpoint: up to 16 address bytes, a port and the address family.
/// Equality is structural over all three fields.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct InetAddress {
    bytes: [u8; IPV6_ADDR_SIZE],
    port: u16,
    family: Family,
}

impl InetAddress {
    /// Parses a textual IP with `inet_pton`. Fails with `InvalidArg` when
    /// the text does not parse in the given family.
    pub fn new(ip: &str, port: u16, family: Family) -> Result<InetAddress> {
        let text = CString::new(ip).map_err(|_| Error::invalid_arg("ip contains NUL"))?;
        let mut bytes = [0u8; IPV6_ADDR_SIZE];
        match family {
            Family::Ipv4 => {
                let mut addr: libc::in_addr = unsafe { mem::zeroed() };
                let rc = unsafe {
                    inet_pton(
                        libc::AF_INET,
                        text.as_ptr(),
                        &mut addr as *mut libc::in_addr as *mut libc::c_void,
                    )
                };
                if rc != 1 {
                    return Err(Error::with_detail(
                        crate::ErrorKind::InvalidArg,
                        "not an IPv4 address",
                        ip,
                    ));
                }
                bytes[..IPV4_ADDR_SIZE].copy_from_slice(&addr.s_addr.to_ne_bytes());
            }
            Family::Ipv6 => {
                let mut addr: libc::in6_addr = unsafe { mem::zeroed() };
                let rc = unsafe {
                    inet_pton(
                        libc::AF_INET6,
                        text.as_ptr(),
                        &mut addr as *mut libc::in6_addr as *mut libc::c_void,
                    )
                };
                if rc != 1 {
                    return Err(Error::with_detail(
                        crate::ErrorKind::InvalidArg,
                        "not an IPv6 address",
                        ip,
                    ));
                }
                bytes.copy_from_slice(&addr.s6_addr);
            }
            Family::Any => return Err(Error::invalid_arg("address family unspecified")),
        }
        Ok(InetAddress { bytes, port, family })
    }

    /// Shorthand for an IPv4 endpoint.
    pub fn ipv4(ip: &str, port: u16) -> Result<InetAddress> {
        InetAddress::new(ip, port, Family::Ipv4)
    }

    /// Shorthand for an IPv6 endpoint.
    pub fn ipv6(ip: &str, port: u16) -> Result<InetAddress> {
        InetAddress::new(ip, port, Family::Ipv6)
    }

    /// Textual address; IPv6 is bracketed with the longest zero run
    /// contracted to `::`.
    pub fn ip(&self) -> String {
        match self.family {
            Family::Ipv4 => {
                let b = &self.bytes;
                format!("{}.{}.{}.{}", b[0], b[1], b[2], b[3])
            }
            Family::Ipv6 => format_ipv6(&self.bytes),
            Family::Any => String::new(),
        }
    }

    pub fn port(&self) -> u16 { self.port }

    pub fn family(&self) -> Family { self.family }
}

impl Display for InetAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip(), self.port)
    }
}

/// Longest run (length > 2 bytes) of zero 16-bit groups, as (start, len) in
/// bytes; `len == 0` when there is nothing worth contracting.
fn ipv6_contraction_range(bytes: &[u8; IPV6_ADDR_SIZE]) -> (usize, usize) {
    let mut best = (0, 0);
    let mut current = (0, 0);
    for i in (0..IPV6_ADDR_SIZE).step_by(2) {
        let is_zero = bytes[i] == 0 && bytes[i + 1] == 0;
        if is_zero {
            if current.1 == 0 {
                current.0 = i;
            }
            current.1 += 2;
        }
        if !is_zero || i == IPV6_ADDR_SIZE - 2 {
            if current.1 > 2 && current.1 > best.1 {
                best = current;
            }
            current = (0, 0);
        }
    }
    best
}

fn format_ipv6(bytes: &[u8; IPV6_ADDR_SIZE]) -> String {
    let (skip_start, skip_len) = ipv6_contraction_range(bytes);
    let mut out = String::from("[");
    let mut i = 0;
    while i < IPV6_ADDR_SIZE {
        if i == skip_start && skip_len > 0 {
            if i == 0 {
                out.push(':');
            }
            out.push(':');
            i += skip_len;
        } else {
            let group = (bytes[i] as u16) << 8 | bytes[i + 1] as u16;
            write!(out, "{group:x}").expect("writing to a string");
            i += 2;
            if i < IPV6_ADDR_SIZE && i != skip_start {
                out.push(':');
            }
        }
    }
    out.push(']');
    out
}

/// A `sockaddr_storage` with its length, the syscall-facing form of an
/// [`InetAddress`]. Conversion in both directions is total and lossless for
/// the supported families.
#[derive(Copy, Clone)]
pub(crate) struct SockaddrStorage {
    storage: libc::sockaddr_storage,
    len: libc::socklen_t,
}

impl SockaddrStorage {
    pub(crate) fn zeroed() -> SockaddrStorage {
        SockaddrStorage {
            storage: unsafe { mem::zeroed() },
            len: mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t,
        }
    }

    pub(crate) fn from_inet(addr: &InetAddress) -> Result<SockaddrStorage> {
        let mut out = SockaddrStorage::zeroed();
        match addr.family {
            Family::Ipv4 => {
                let sin = libc::sockaddr_in {
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: addr.port.to_be(),
                    sin_addr: libc::in_addr {
                        s_addr: u32::from_ne_bytes(
                            addr.bytes[..IPV4_ADDR_SIZE].try_into().expect("4 bytes"),
                        ),
                    },
                    sin_zero: [0; 8],
                };
                unsafe {
                    (&mut out.storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in)
                        .write(sin)
                };
                out.len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
            }
            Family::Ipv6 => {
                let sin6 = libc::sockaddr_in6 {
                    sin6_family: libc::AF_INET6 as libc::sa_family_t,
                    sin6_port: addr.port.to_be(),
                    sin6_flowinfo: 0,
                    sin6_addr: libc::in6_addr { s6_addr: addr.bytes },
                    sin6_scope_id: 0,
                };
                unsafe {
                    (&mut out.storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in6)
                        .write(sin6)
                };
                out.len = mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
            }
            Family::Any => return Err(Error::invalid_arg("address family unspecified")),
        }
        Ok(out)
    }

    pub(crate) fn to_inet(&self) -> InetAddress {
        let mut out = InetAddress::default();
        match self.storage.ss_family as libc::c_int {
            libc::AF_INET => {
                let sin = unsafe {
                    &*(&self.storage as *const libc::sockaddr_storage as *const libc::sockaddr_in)
                };
                out.bytes[..IPV4_ADDR_SIZE].copy_from_slice(&sin.sin_addr.s_addr.to_ne_bytes());
                out.port = u16::from_be(sin.sin_port);
                out.family = Family::Ipv4;
            }
            libc::AF_INET6 => {
                let sin6 = unsafe {
                    &*(&self.storage as *const libc::sockaddr_storage as *const libc::sockaddr_in6)
                };
                out.bytes.copy_from_slice(&sin6.sin6_addr.s6_addr);
                out.port = u16::from_be(sin6.sin6_port);
                out.family = Family::Ipv6;
            }
            _ => {}
        }
        out
    }

    pub(crate) fn family(&self) -> libc::c_int { self.storage.ss_family as libc::c_int }

    pub(crate) fn as_ptr(&self) -> *const libc::sockaddr {
        &self.storage as *const libc::sockaddr_storage as *const libc::sockaddr
    }

    pub(crate) fn as_mut_parts(&mut self) -> (*mut libc::sockaddr, *mut libc::socklen_t) {
        (
            &mut self.storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
            &mut self.len,
        )
    }

    pub(crate) fn len(&self) -> libc::socklen_t { self.len }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ipv4() {
        let addr = InetAddress::ipv4("127.0.0.1", 8080).unwrap();
        assert_eq!(addr.ip(), "127.0.0.1");
        assert_eq!(addr.port(), 8080);
        assert_eq!(addr.family(), Family::Ipv4);
        assert_eq!(addr.to_string(), "127.0.0.1:8080");
    }

    #[test]
    fn parses_ipv6() {
        let addr = InetAddress::ipv6("::1", 443).unwrap();
        assert_eq!(addr.family(), Family::Ipv6);
        assert_eq!(addr.ip(), "[::1]");

        let full = InetAddress::ipv6("2001:db8::8:800:200c:417a", 0).unwrap();
        assert_eq!(full.ip(), "[2001:db8::8:800:200c:417a]");

        let noncontract = InetAddress::ipv6("2001:db8:1:2:3:4:5:6", 0).unwrap();
        assert_eq!(noncontract.ip(), "[2001:db8:1:2:3:4:5:6]");
    }

    #[test]
    fn rejects_garbage() {
        assert!(InetAddress::ipv4("not an ip", 1).is_err());
        assert!(InetAddress::ipv4("256.0.0.1", 1).is_err());
        assert!(InetAddress::ipv6("127.0.0.1", 1).is_err());
        assert!(InetAddress::new("::1", 1, Family::Any).is_err());
    }

    #[test]
    fn structural_equality() {
        let a = InetAddress::ipv4("10.0.0.1", 80).unwrap();
        let b = InetAddress::ipv4("10.0.0.1", 80).unwrap();
        let c = InetAddress::ipv4("10.0.0.1", 81).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn sockaddr_round_trip_is_identity() {
        for addr in [
            InetAddress::ipv4("127.0.0.1", 0).unwrap(),
            InetAddress::ipv4("192.168.17.4", 65535).unwrap(),
            InetAddress::ipv6("::1", 4242).unwrap(),
            InetAddress::ipv6("2001:db8::1", 80).unwrap(),
        ] {
            let storage = SockaddrStorage::from_inet(&addr).unwrap();
            assert_eq!(storage.to_inet(), addr);
        }
    }

    #[test]
    fn sockaddr_family_matches() {
        let v4 = SockaddrStorage::from_inet(&InetAddress::ipv4("1.2.3.4", 5).unwrap()).unwrap();
        assert_eq!(v4.family(), libc::AF_INET);
        let v6 = SockaddrStorage::from_inet(&InetAddress::ipv6("::", 5).unwrap()).unwrap();
        assert_eq!(v6.family(), libc::AF_INET6);
    }
}
