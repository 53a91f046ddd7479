// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Network interface discovery and selection.
//!
//! Uses the `local_ip_address` crate to enumerate system interfaces and
//! resolves OS interface indexes for multicast membership. Loopback is used
//! only as a fallback when no other interface exists (containers, CI).

use std::net::IpAddr;

use crate::error::{Error, Result};

/// Address family of a network interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IpType {
    V4,
    V6,
}

/// Identifies one multicast-capable interface for one address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NetintId {
    /// OS interface index.
    pub index: u32,
    pub ip_type: IpType,
}

/// One requested interface plus the per-interface result the engine fills
/// in. Partial success is success: a receiver works as long as any
/// interface does.
#[derive(Debug)]
pub struct McastInterface {
    pub iface: NetintId,
    pub status: Result<()>,
}

impl McastInterface {
    #[must_use]
    pub fn new(iface: NetintId) -> Self {
        Self {
            iface,
            status: Ok(()),
        }
    }
}

/// A system interface as discovered at init or networking reset.
#[derive(Debug, Clone)]
pub(crate) struct SysNetint {
    pub id: NetintId,
    pub addr: IpAddr,
    pub name: String,
}

#[cfg(unix)]
fn interface_index(name: &str) -> u32 {
    let Ok(cname) = std::ffi::CString::new(name) else {
        return 0;
    };
    // SAFETY: if_nametoindex reads a NUL-terminated string and returns 0 on
    // failure; no memory is retained.
    unsafe { libc::if_nametoindex(cname.as_ptr()) }
}

#[cfg(not(unix))]
fn interface_index(_name: &str) -> u32 {
    0
}

/// Enumerate the system's usable interfaces.
pub(crate) fn discover_netints() -> Vec<SysNetint> {
    let interfaces = match local_ip_address::list_afinet_netifas() {
        Ok(list) => list,
        Err(e) => {
            log::debug!("[NETINT] failed to list network interfaces: {}", e);
            return Vec::new();
        }
    };

    let mut netints = Vec::new();
    let mut loopbacks = Vec::new();
    for (name, addr) in interfaces {
        let index = interface_index(&name);
        if index == 0 {
            log::debug!("[NETINT] no index for interface '{}', skipping", name);
            continue;
        }
        let ip_type = match addr {
            IpAddr::V4(_) => IpType::V4,
            IpAddr::V6(_) => IpType::V6,
        };
        let entry = SysNetint {
            id: NetintId { index, ip_type },
            addr,
            name: name.clone(),
        };
        if addr.is_loopback() {
            loopbacks.push(entry);
        } else {
            netints.push(entry);
        }
    }

    if netints.is_empty() {
        log::debug!(
            "[NETINT] no non-loopback interfaces found, falling back to {} loopback entries",
            loopbacks.len()
        );
        netints = loopbacks;
    }

    log::debug!("[NETINT] discovered {} interfaces", netints.len());
    netints
}

/// Resolve the interfaces a component will use.
///
/// With an explicit list, each entry's status is filled in and only the
/// found ones are returned; if none are usable the result is *no-netints*.
/// With no list, all system interfaces are used.
pub(crate) fn select_netints(
    sys_netints: &[SysNetint],
    requested: Option<&mut [McastInterface]>,
) -> Result<Vec<SysNetint>> {
    let selected = match requested {
        None => sys_netints.to_vec(),
        Some(list) => {
            let mut found = Vec::new();
            for entry in list.iter_mut() {
                match sys_netints.iter().find(|n| n.id == entry.iface) {
                    Some(netint) => {
                        entry.status = Ok(());
                        found.push(netint.clone());
                    }
                    None => entry.status = Err(Error::NotFound),
                }
            }
            found
        }
    };

    if selected.is_empty() {
        return Err(Error::NoNetints);
    }
    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_all_when_unrestricted() {
        let sys = vec![SysNetint {
            id: NetintId {
                index: 2,
                ip_type: IpType::V4,
            },
            addr: "192.0.2.1".parse().unwrap(),
            name: "eth0".into(),
        }];
        let selected = select_netints(&sys, None).unwrap();
        assert_eq!(selected.len(), 1);
    }

    #[test]
    fn test_select_fills_statuses() {
        let sys = vec![SysNetint {
            id: NetintId {
                index: 2,
                ip_type: IpType::V4,
            },
            addr: "192.0.2.1".parse().unwrap(),
            name: "eth0".into(),
        }];
        let mut requested = vec![
            McastInterface::new(NetintId {
                index: 2,
                ip_type: IpType::V4,
            }),
            McastInterface::new(NetintId {
                index: 99,
                ip_type: IpType::V4,
            }),
        ];
        let selected = select_netints(&sys, Some(&mut requested)).unwrap();
        assert_eq!(selected.len(), 1);
        assert!(requested[0].status.is_ok());
        assert!(matches!(requested[1].status, Err(Error::NotFound)));
    }

    #[test]
    fn test_no_usable_interfaces_is_no_netints() {
        let sys: Vec<SysNetint> = Vec::new();
        assert!(matches!(select_netints(&sys, None), Err(Error::NoNetints)));

        let sys = vec![SysNetint {
            id: NetintId {
                index: 2,
                ip_type: IpType::V4,
            },
            addr: "192.0.2.1".parse().unwrap(),
            name: "eth0".into(),
        }];
        let mut requested = vec![McastInterface::new(NetintId {
            index: 99,
            ip_type: IpType::V4,
        })];
        assert!(matches!(
            select_netints(&sys, Some(&mut requested)),
            Err(Error::NoNetints)
        ));
    }
}
