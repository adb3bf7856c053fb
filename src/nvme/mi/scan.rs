// SPDX-License-Identifier: GPL-3.0-only
/*
 * Copyright (c) 2025 Code Construct
 */
use std::collections::BTreeMap;
use std::io;

use log::{debug, error};
use mctp::Eid;

use super::mctp::MctpTransport;
use super::{Error, Result, Root};

pub const MCTP_DBUS_PATH: &str = "/xyz/openbmc_project/mctp";
pub const MCTP_DBUS_IFACE: &str = "xyz.openbmc_project.MCTP";
pub const MCTP_DBUS_IFACE_ENDPOINT: &str = "xyz.openbmc_project.MCTP.Endpoint";

/// Property values the discovery walk understands. Implementations may
/// surface other variants through their own mapping; they are skipped.
#[derive(Clone, Debug, PartialEq)]
pub enum PropertyValue {
    Bool(bool),
    Byte(u8),
    Int32(i32),
    UInt32(u32),
    String(String),
    ByteArray(Vec<u8>),
}

pub type PropertyMap = BTreeMap<String, PropertyValue>;
pub type InterfaceMap = BTreeMap<String, PropertyMap>;
pub type ObjectTree = BTreeMap<String, InterfaceMap>;

/// Object-manager surface consumed by discovery: one `GetManagedObjects`
/// round trip against the well-known MCTP service.
pub trait ObjectManager {
    fn managed_objects(&mut self, service: &str, path: &str) -> io::Result<ObjectTree>;
}

/// Extract the MCTP address from an endpoint interface's properties.
///
/// Endpoints that do not advertise NVMe-MI support are ignored; an
/// NVMe-MI-capable endpoint missing its address properties is an error.
fn endpoint_from_props(props: &PropertyMap) -> Result<Option<(i32, Eid)>> {
    let nvme_mi = match props.get("SupportedMessageTypes") {
        Some(PropertyValue::ByteArray(types)) => types.contains(&mctp::MCTP_TYPE_NVME.0),
        _ => false,
    };

    if !nvme_mi {
        return Ok(None);
    }

    let Some(PropertyValue::Byte(eid)) = props.get("EID") else {
        return Err(Error::Protocol("missing EID property"));
    };

    let Some(PropertyValue::Int32(net)) = props.get("NetworkId") else {
        return Err(Error::Protocol("missing NetworkId property"));
    };

    Ok(Some((*net, Eid(*eid))))
}

/// Walk a managed-object tree for NVMe-MI-capable MCTP endpoints. Parse
/// failures on individual objects are logged without aborting the walk.
fn mctp_endpoint_candidates(tree: &ObjectTree) -> Vec<(i32, Eid)> {
    let mut out = Vec::new();

    for (path, interfaces) in tree {
        let Some(props) = interfaces.get(MCTP_DBUS_IFACE_ENDPOINT) else {
            continue;
        };

        match endpoint_from_props(props) {
            Ok(Some(ep)) => out.push(ep),
            Ok(None) => debug!("Ignoring endpoint {path} without NVMe-MI support"),
            Err(err) => error!("Missing property for {path}: {err}"),
        }
    }

    out
}

impl Root {
    /// Scan the system object-manager bus for MCTP endpoints advertising
    /// NVMe-MI support, opening an endpoint for each new `(network, eid)`.
    /// Already-known addresses are skipped.
    pub fn scan_mctp(&mut self, bus: &mut dyn ObjectManager) -> Result<()> {
        let tree = bus
            .managed_objects(MCTP_DBUS_IFACE, MCTP_DBUS_PATH)
            .map_err(|err| {
                error!("Failed querying MCTP bus objects: {err}");
                Error::Resource(err)
            })?;

        for (net, eid) in mctp_endpoint_candidates(&tree) {
            if self.has_mctp_endpoint(net, eid) {
                continue;
            }
            if let Err(err) = self.open_mctp(net, eid) {
                error!("Error adding net {net} eid {}: {err}", eid.0);
            }
        }

        Ok(())
    }

    fn has_mctp_endpoint(&self, net: i32, eid: Eid) -> bool {
        self.endpoints().any(|ep| {
            ep.transport()
                .as_any()
                .downcast_ref::<MctpTransport>()
                .is_some_and(|t| t.net() == net && t.eid().0 == eid.0)
        })
    }
}
