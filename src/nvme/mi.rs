// SPDX-License-Identifier: GPL-3.0-only
/*
 * Copyright (c) 2025 Code Construct
 */
pub mod admin;
pub mod mctp;
mod mic;
pub mod scan;

use std::any::Any;

use deku::DekuContainerWrite;
use deku::ctx::Endian;
use deku::prelude::*;
use flagset::{FlagSet, flags};
use log::{debug, warn};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use thiserror::Error;

pub use admin::Controller;

/// NVMe message type byte as it appears on the wire: NVMe (0x04) with the
/// integrity-check bit set.
pub const MSGTYPE_NVME: u8 = 0x04 | 0x80;

/// Generic MI message header: type byte, NMP byte, MEB byte, one reserved.
pub const MSG_HDR_SIZE: usize = 4;

/// Smallest complete response message: generic header, status, `nmresp`.
pub const RESP_HDR_SIZE: usize = 8;

const ROR_REQ: u8 = 0;
const DEFAULT_TIMEOUT_MS: u32 = 1000;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("transport i/o failure")]
    Io(#[source] std::io::Error),
    #[error("timed out waiting for endpoint response")]
    Timeout,
    #[error("response failed message integrity check")]
    Integrity,
    #[error("protocol error: {0}")]
    Protocol(&'static str),
    #[error("resource allocation failure")]
    Resource(#[source] std::io::Error),
    #[error("endpoint returned status {0:#04x}")]
    Status(u8),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<DekuError> for Error {
    fn from(err: DekuError) -> Self {
        debug!("Codec operation failed: {err}");
        Error::Protocol("codec failure")
    }
}

pub(crate) trait Encode<const S: usize>: DekuContainerWrite {
    fn encode(&self) -> std::result::Result<([u8; S], usize), DekuError> {
        let bytes = self.to_bytes()?;
        let mut buf = [0u8; S];
        let Some(dst) = buf.get_mut(..bytes.len()) else {
            return Err(DekuError::InvalidParam("encoded message exceeds buffer".into()));
        };
        dst.copy_from_slice(&bytes);
        Ok((buf, bytes.len()))
    }
}

/// Message types carried in bits 6:3 of the NMP byte.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum MessageType {
    ControlPrimitive = 0x00,
    MiCommand = 0x01,
    AdminCommand = 0x02,
    PcieCommand = 0x04,
}

/// NMP byte for a generated request: ROR clear, command slot 0.
pub(crate) fn request_nmp(mt: MessageType) -> u8 {
    (ROR_REQ << 7) | ((mt as u8 & 0xf) << 3)
}

/// Response status values the host inspects directly; all others are
/// propagated verbatim as [`Error::Status`].
// MI v2.0, 4.1.2, Figure 35
#[derive(Clone, Copy, Debug, Eq, FromPrimitive, PartialEq)]
#[repr(u8)]
pub enum ResponseStatus {
    Success = 0x00,
    MoreProcessingRequired = 0x20,
}

/// One outbound MI message: a prebuilt header, an optional payload, and the
/// integrity check computed at submission time.
pub struct MiRequest<'a> {
    pub hdr: &'a [u8],
    pub data: &'a [u8],
    pub mic: u32,
}

impl<'a> MiRequest<'a> {
    pub fn new(hdr: &'a [u8]) -> Self {
        Self {
            hdr,
            data: &[],
            mic: 0,
        }
    }

    pub fn with_data(hdr: &'a [u8], data: &'a [u8]) -> Self {
        Self { hdr, data, mic: 0 }
    }
}

/// One inbound MI message. Buffer capacities are supplied by the caller;
/// lengths and the received MIC are written by the transport.
pub struct MiResponse<'a> {
    pub hdr: &'a mut [u8],
    pub hdr_len: usize,
    pub data: &'a mut [u8],
    pub data_len: usize,
    pub mic: u32,
}

impl<'a> MiResponse<'a> {
    pub fn new(hdr: &'a mut [u8], data: &'a mut [u8]) -> Self {
        let hdr_len = hdr.len();
        let data_len = data.len();
        Self {
            hdr,
            hdr_len,
            data,
            data_len,
            mic: 0,
        }
    }
}

/// Per-submission parameters resolved from endpoint state.
pub struct SubmitParams {
    pub timeout: u32,
    pub mprt_max: u32,
}

/// Capability set attached to each endpoint. `as_any` exposes the concrete
/// state so transport-specific callers can reject foreign endpoints.
pub trait Transport {
    /// Short transport family name used in endpoint descriptions.
    fn name(&self) -> &'static str;

    fn mic_enabled(&self) -> bool;

    fn submit(
        &mut self,
        params: &SubmitParams,
        req: &MiRequest,
        resp: &mut MiResponse,
    ) -> Result<()>;

    /// Transport-specific endpoint detail for descriptions.
    fn desc_ep(&self) -> String;

    /// Veto timeout values the transport cannot honour.
    fn check_timeout(&self, _timeout_ms: u32) -> Result<()> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any;
}

/// Container for a set of discovered or explicitly opened endpoints.
#[derive(Default)]
pub struct Root {
    endpoints: Vec<Endpoint>,
}

impl Root {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn init_endpoint(&mut self, transport: Box<dyn Transport>) -> &mut Endpoint {
        self.endpoints.push(Endpoint::new(transport));
        self.endpoints
            .last_mut()
            .expect("endpoint list cannot be empty after push")
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.iter()
    }

    pub fn endpoints_mut(&mut self) -> impl Iterator<Item = &mut Endpoint> {
        self.endpoints.iter_mut()
    }
}

#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct ControllerId(pub u16);

/// One logical connection to an NVMe subsystem.
pub struct Endpoint {
    transport: Box<dyn Transport>,
    timeout: u32,
    mprt_max: u32,
    controllers_scanned: bool,
    controllers: Vec<ControllerId>,
}

impl Endpoint {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            timeout: DEFAULT_TIMEOUT_MS,
            mprt_max: 0,
            controllers_scanned: false,
            controllers: Vec::new(),
        }
    }

    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub fn set_timeout(&mut self, timeout_ms: u32) -> Result<()> {
        self.transport.check_timeout(timeout_ms)?;
        self.timeout = timeout_ms;
        Ok(())
    }

    pub fn timeout(&self) -> u32 {
        self.timeout
    }

    /// Upper bound applied to device-requested "more processing required"
    /// wait times. Zero means unlimited.
    pub fn set_mprt_max(&mut self, mprt_max_ms: u32) {
        self.mprt_max = mprt_max_ms;
    }

    pub fn description(&self) -> String {
        let detail = self.transport.desc_ep();
        if detail.is_empty() {
            format!("{} endpoint", self.transport.name())
        } else {
            format!("{}: {}", self.transport.name(), detail)
        }
    }

    /// Submit a prebuilt request and collect the response.
    ///
    /// Validates framing invariants, computes and verifies the integrity
    /// check when the transport carries one, and applies the generic
    /// response sanity checks. Transport failures are returned unchanged.
    pub fn submit(&mut self, req: &mut MiRequest, resp: &mut MiResponse) -> Result<()> {
        if req.hdr.len() < MSG_HDR_SIZE {
            return Err(Error::InvalidArgument("request header too short"));
        }

        if req.hdr.len() & 0x3 != 0 {
            return Err(Error::InvalidArgument("request header length unaligned"));
        }

        if req.data.len() & 0x3 != 0 {
            return Err(Error::InvalidArgument("request data length unaligned"));
        }

        if resp.hdr.len() < MSG_HDR_SIZE {
            return Err(Error::InvalidArgument("response header too short"));
        }

        if resp.hdr.len() & 0x3 != 0 {
            return Err(Error::InvalidArgument("response header length unaligned"));
        }

        if resp.data.len() & 0x3 != 0 {
            return Err(Error::InvalidArgument("response data length unaligned"));
        }

        if self.transport.mic_enabled() {
            req.mic = mic::message_integrity_check(req.hdr, req.data);
        }

        let params = SubmitParams {
            timeout: self.timeout,
            mprt_max: self.mprt_max,
        };
        self.transport.submit(&params, req, resp)?;

        if self.transport.mic_enabled() {
            let crc = mic::message_integrity_check(
                &resp.hdr[..resp.hdr_len],
                &resp.data[..resp.data_len],
            );
            if resp.mic != crc {
                warn!("Response integrity check mismatch: {:#010x} != {:#010x}", resp.mic, crc);
                return Err(Error::Integrity);
            }
        }

        if resp.hdr_len < MSG_HDR_SIZE {
            debug!("Bad response header length: {}", resp.hdr_len);
            return Err(Error::Protocol("response header too short"));
        }

        if resp.hdr[0] != MSGTYPE_NVME {
            debug!("Invalid response message type {:#04x}", resp.hdr[0]);
            return Err(Error::Protocol("unexpected message type"));
        }

        if resp.hdr[1] & 0x80 == 0 {
            debug!("ROR value in response indicates a request");
            return Err(Error::Protocol("response direction bit clear"));
        }

        if (resp.hdr[1] ^ req.hdr[1]) & 0x1 != 0 {
            warn!(
                "Command slot mismatch: req {}, resp {}",
                req.hdr[1] & 0x1,
                resp.hdr[1] & 0x1
            );
            return Err(Error::Protocol("command slot mismatch"));
        }

        Ok(())
    }

    /// Scan the endpoint's controller list, registering a record for each
    /// reported controller. A successful scan is not repeated unless
    /// `force_rescan` is set.
    pub fn scan(&mut self, force_rescan: bool) -> Result<()> {
        if self.controllers_scanned {
            if !force_rescan {
                return Ok(());
            }
            self.controllers.clear();
        }

        let list = self.read_mi_data_ctrl_list(0)?;
        for id in list {
            if id.0 == 0 {
                continue;
            }
            self.controllers.push(id);
        }

        self.controllers_scanned = true;
        Ok(())
    }

    pub fn controllers(&self) -> impl Iterator<Item = ControllerId> + '_ {
        self.controllers.iter().copied()
    }

    /// Register a controller record explicitly, without scanning.
    pub fn init_controller(&mut self, id: ControllerId) -> Controller<'_> {
        if !self.controllers.contains(&id) {
            self.controllers.push(id);
        }
        Controller::new(self, id)
    }

    pub fn controller(&mut self, id: ControllerId) -> Option<Controller<'_>> {
        self.controllers
            .contains(&id)
            .then(move || Controller::new(self, id))
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        // Suppress implicit rescans during teardown
        self.controllers_scanned = true;
        self.controllers.clear();
    }
}

// MI v2.0, 5, Figure 104
#[derive(Debug, DekuRead, DekuWrite)]
#[deku(endian = "little")]
struct MiCommandRequestHeader {
    typ: u8,
    #[deku(pad_bytes_after = "2")]
    nmp: u8,
    #[deku(pad_bytes_after = "3")]
    opcode: MiCommandOpcode,
    cdw0: u32,
    cdw1: u32,
}
impl Encode<16> for MiCommandRequestHeader {}

impl MiCommandRequestHeader {
    fn new(opcode: MiCommandOpcode, cdw0: u32, cdw1: u32) -> Self {
        Self {
            typ: MSGTYPE_NVME,
            nmp: request_nmp(MessageType::MiCommand),
            opcode,
            cdw0,
            cdw1,
        }
    }
}

// MI v2.0, 5, Figure 105
#[derive(Debug, DekuRead, DekuWrite)]
#[deku(endian = "little")]
struct MiCommandResponseHeader {
    typ: u8,
    #[deku(pad_bytes_after = "2")]
    nmp: u8,
    status: u8,
    nmresp: [u8; 3],
}

// MI v2.0, Figure 29
#[derive(Clone, Copy, Debug, DekuRead, DekuWrite, Eq, PartialEq)]
#[deku(id_type = "u8", endian = "endian", ctx = "endian: Endian")]
#[repr(u8)]
enum MiCommandOpcode {
    ReadNvmeMiDataStructure = 0x00,
    NvmSubsystemHealthStatusPoll = 0x01,
    ConfigurationSet = 0x03,
    ConfigurationGet = 0x04,
}

// MI v2.0, 5.7, Figure 129, DTYP
const DTYP_SUBSYS_INFO: u32 = 0x00;
const DTYP_PORT_INFO: u32 = 0x01;
const DTYP_CTRL_LIST: u32 = 0x02;
const DTYP_CTRL_INFO: u32 = 0x03;

const CTRL_LIST_MAX: usize = 2047;

// MI v2.0, 5.7.1, Figure 131
#[derive(Debug, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct NvmSubsystemInfo {
    pub nump: u8,
    pub mjr: u8,
    #[deku(pad_bytes_after = "29")]
    pub mnr: u8,
}

impl NvmSubsystemInfo {
    const SIZE: usize = 32;
}

/// Port type values reported in [`PortInfo::portt`].
#[derive(Clone, Copy, Debug, Eq, FromPrimitive, PartialEq)]
#[repr(u8)]
pub enum PortType {
    Inactive = 0x00,
    Pcie = 0x01,
    TwoWire = 0x02,
}

// MI v2.0, 5.7.2, Figure 132
#[derive(Debug, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct PortInfo {
    #[deku(pad_bytes_after = "1")]
    pub portt: u8,
    pub mmctptus: u16,
    pub meb: u32,
    pub specific: [u8; 24],
}

impl PortInfo {
    const SIZE: usize = 32;

    pub fn port_type(&self) -> Option<PortType> {
        PortType::from_u8(self.portt)
    }

    pub fn pcie(&self) -> Result<PciePortData> {
        if self.port_type() != Some(PortType::Pcie) {
            return Err(Error::InvalidArgument("not a PCIe port"));
        }
        let ((_, _), pd) = PciePortData::from_bytes((&self.specific[..], 0))?;
        Ok(pd)
    }

    pub fn two_wire(&self) -> Result<TwoWirePortData> {
        if self.port_type() != Some(PortType::TwoWire) {
            return Err(Error::InvalidArgument("not a two-wire port"));
        }
        let ((_, _), td) = TwoWirePortData::from_bytes((&self.specific[..], 0))?;
        Ok(td)
    }
}

// MI v2.0, 5.7.2, Figure 133
#[derive(Debug, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct PciePortData {
    pub mps: u8,
    pub sls: u8,
    pub cls: u8,
    pub mlw: u8,
    pub nlw: u8,
    pub pn: u8,
}

// MI v2.0, 5.7.2, Figure 134
#[derive(Debug, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct TwoWirePortData {
    pub vpd_addr: u8,
    pub mvpd_freq: u8,
    pub mme_addr: u8,
    pub mme_freq: u8,
    pub nvmebm: u8,
}

// MI v2.0, 5.7.4, Figure 136
#[derive(Debug, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct ControllerInfo {
    #[deku(pad_bytes_after = "4")]
    pub portid: u8,
    pub prii: u8,
    pub pri: u16,
    pub vid: u16,
    pub did: u16,
    pub ssvid: u16,
    #[deku(pad_bytes_after = "16")]
    pub ssid: u16,
}

impl ControllerInfo {
    const SIZE: usize = 32;
}

// Base v2.1, Figure 137; identifiers are 16 bits wide
#[derive(Debug, DekuRead, DekuWrite)]
#[deku(endian = "little")]
struct ControllerList {
    num: u16,
    #[deku(count = "num")]
    ids: Vec<u16>,
}

flags! {
    // MI v2.0, 5.6, Figure 108, NSS
    pub enum NvmSubsystemStatus: u8 {
        P1la = 1 << 2,
        P0la = 1 << 3,
        Rnr = 1 << 4,
        Df = 1 << 5,
        Sfm = 1 << 6,
        Atf = 1 << 7,
    }
}

// MI v2.0, 5.6, Figure 108
#[derive(Debug, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct NvmSubsystemHealthStatus {
    pub nss: u8,
    pub sw: u8,
    pub ctemp: u8,
    pub pdlu: u8,
    #[deku(pad_bytes_after = "2")]
    pub ccs: u16,
}

impl NvmSubsystemHealthStatus {
    const SIZE: usize = 8;

    pub fn status_flags(&self) -> FlagSet<NvmSubsystemStatus> {
        FlagSet::new_truncated(self.nss)
    }
}

/// Configuration identifiers for Configuration Get/Set.
// MI v2.0, Figure 142
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum ConfigurationId {
    SmbusI2cFrequency = 0x01,
    HealthStatusChange = 0x02,
    MctpTransmissionUnitSize = 0x03,
}

#[derive(Clone, Copy, Debug, Eq, FromPrimitive, PartialEq)]
#[repr(u8)]
pub enum SmbusFrequency {
    FreqNotSupported = 0x00,
    Freq100kHz = 0x01,
    Freq400kHz = 0x02,
    Freq1MHz = 0x03,
}

impl Endpoint {
    /// One MI command round trip carrying no request payload. Returns the
    /// response status, `nmresp` bytes and received data length.
    fn mi_command(
        &mut self,
        opcode: MiCommandOpcode,
        cdw0: u32,
        cdw1: u32,
        data: &mut [u8],
    ) -> Result<([u8; 3], usize)> {
        let hdr = MiCommandRequestHeader::new(opcode, cdw0, cdw1).encode()?;
        let mut req = MiRequest::new(&hdr.0);

        let mut resp_hdr = [0u8; RESP_HDR_SIZE];
        let mut resp = MiResponse::new(&mut resp_hdr, data);

        self.submit(&mut req, &mut resp)?;
        let data_len = resp.data_len;

        let ((_, _), rh) = MiCommandResponseHeader::from_bytes((&resp_hdr[..], 0))?;
        if rh.status != 0 {
            return Err(Error::Status(rh.status));
        }

        Ok((rh.nmresp, data_len))
    }

    fn read_data(&mut self, cdw0: u32, data: &mut [u8]) -> Result<usize> {
        let (_, len) = self.mi_command(MiCommandOpcode::ReadNvmeMiDataStructure, cdw0, 0, data)?;
        Ok(len)
    }

    pub fn read_mi_data_subsys(&mut self) -> Result<NvmSubsystemInfo> {
        let mut buf = [0u8; NvmSubsystemInfo::SIZE];
        let len = self.read_data(DTYP_SUBSYS_INFO << 24, &mut buf)?;
        if len != buf.len() {
            warn!("MI read data length mismatch: got {len} bytes, expected {}", buf.len());
            return Err(Error::Protocol("subsystem info length mismatch"));
        }
        let ((_, _), info) = NvmSubsystemInfo::from_bytes((&buf[..], 0))?;
        Ok(info)
    }

    pub fn read_mi_data_port(&mut self, portid: u8) -> Result<PortInfo> {
        let mut buf = [0u8; PortInfo::SIZE];
        let cdw0 = DTYP_PORT_INFO << 24 | (portid as u32) << 16;
        let len = self.read_data(cdw0, &mut buf)?;
        if len != buf.len() {
            return Err(Error::Protocol("port info length mismatch"));
        }
        let ((_, _), info) = PortInfo::from_bytes((&buf[..], 0))?;
        Ok(info)
    }

    pub fn read_mi_data_ctrl_list(&mut self, start_ctrlid: u8) -> Result<Vec<ControllerId>> {
        let mut buf = [0u8; 4096];
        let cdw0 = DTYP_CTRL_LIST << 24 | (start_ctrlid as u32) << 16;
        let len = self.read_data(cdw0, &mut buf)?;

        let ((_, _), list) = ControllerList::from_bytes((&buf[..len], 0))?;
        if list.num as usize > CTRL_LIST_MAX {
            return Err(Error::Protocol("controller list too long"));
        }

        Ok(list.ids.into_iter().map(ControllerId).collect())
    }

    pub fn read_mi_data_ctrl(&mut self, ctrl_id: u16) -> Result<ControllerInfo> {
        let mut buf = [0u8; ControllerInfo::SIZE];
        let cdw0 = DTYP_CTRL_INFO << 24 | ctrl_id as u32;
        let len = self.read_data(cdw0, &mut buf)?;
        if len != buf.len() {
            return Err(Error::Protocol("controller info length mismatch"));
        }
        let ((_, _), info) = ControllerInfo::from_bytes((&buf[..], 0))?;
        Ok(info)
    }

    /// Poll the subsystem health status, optionally clearing the change
    /// flags accumulated since the previous poll.
    pub fn subsystem_health_status_poll(&mut self, clear: bool) -> Result<NvmSubsystemHealthStatus> {
        let mut buf = [0u8; NvmSubsystemHealthStatus::SIZE];
        let cdw1 = (clear as u32) << 31;
        let (_, len) = self.mi_command(
            MiCommandOpcode::NvmSubsystemHealthStatusPoll,
            0,
            cdw1,
            &mut buf,
        )?;
        if len != buf.len() {
            warn!(
                "MI Subsystem Health Status length mismatch: got {len} bytes, expected {}",
                buf.len()
            );
            return Err(Error::Protocol("health status length mismatch"));
        }
        let ((_, _), status) = NvmSubsystemHealthStatus::from_bytes((&buf[..], 0))?;
        Ok(status)
    }

    /// Configuration Get with caller-supplied dwords; returns the 24-bit
    /// management response value.
    pub fn config_get(&mut self, dw0: u32, dw1: u32) -> Result<u32> {
        let mut none = [0u8; 0];
        let (nmresp, _) = self.mi_command(MiCommandOpcode::ConfigurationGet, dw0, dw1, &mut none)?;
        Ok(nmresp[0] as u32 | (nmresp[1] as u32) << 8 | (nmresp[2] as u32) << 16)
    }

    pub fn config_set(&mut self, dw0: u32, dw1: u32) -> Result<()> {
        let mut none = [0u8; 0];
        self.mi_command(MiCommandOpcode::ConfigurationSet, dw0, dw1, &mut none)?;
        Ok(())
    }

    pub fn config_get_smbus_freq(&mut self, port: u8) -> Result<SmbusFrequency> {
        let nmresp = self.config_get(
            ConfigurationId::SmbusI2cFrequency as u32 | (port as u32) << 24,
            0,
        )?;
        SmbusFrequency::from_u8((nmresp & 0x3) as u8)
            .ok_or(Error::Protocol("unrepresentable SMBus frequency"))
    }

    pub fn config_set_smbus_freq(&mut self, port: u8, freq: SmbusFrequency) -> Result<()> {
        self.config_set(
            ConfigurationId::SmbusI2cFrequency as u32
                | (port as u32) << 24
                | ((freq as u32) & 0x3) << 8,
            0,
        )
    }

    pub fn config_get_mctp_mtu(&mut self, port: u8) -> Result<u16> {
        let nmresp = self.config_get(
            ConfigurationId::MctpTransmissionUnitSize as u32 | (port as u32) << 24,
            0,
        )?;
        Ok((nmresp & 0xffff) as u16)
    }

    pub fn config_set_mctp_mtu(&mut self, port: u8, mtu: u16) -> Result<()> {
        self.config_set(
            ConfigurationId::MctpTransmissionUnitSize as u32 | (port as u32) << 24,
            mtu as u32,
        )
    }
}
