// SPDX-License-Identifier: GPL-3.0-only
/*
 * Copyright (c) 2025 Code Construct
 */
use deku::prelude::*;

use crate::nvme::{AdminCommandOpcode, Cns};

use super::{
    ControllerId, Encode, Endpoint, Error, MSGTYPE_NVME, MessageType, MiRequest, MiResponse,
    Result, request_nmp,
};

/// Upper bound on a single Admin data transfer (DLEN limit).
pub const ADMIN_MAX_XFER: usize = 4096;

const ADMIN_RESP_HDR_SIZE: usize = 20;

// CFLGS bits: DLEN valid, DOFF valid
const CFLGS_DLEN: u8 = 0x1;
const CFLGS_DOFF: u8 = 0x2;

/// Admin request message header. Construct with [`AdminRequestHeader::new`],
/// then fill the submission queue entry dwords the command defines.
// MI v2.0, 6.1, Figure 137
#[derive(Debug, Default, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct AdminRequestHeader {
    typ: u8,
    #[deku(pad_bytes_after = "2")]
    nmp: u8,
    pub opcode: u8,
    pub cflgs: u8,
    pub ctlid: u16,
    pub cdw1: u32,
    pub cdw2: u32,
    pub cdw3: u32,
    pub cdw4: u32,
    pub cdw5: u32,
    pub doff: u32,
    #[deku(pad_bytes_after = "8")]
    pub dlen: u32,
    pub cdw10: u32,
    pub cdw11: u32,
    pub cdw12: u32,
    pub cdw13: u32,
    pub cdw14: u32,
    pub cdw15: u32,
}
impl Encode<68> for AdminRequestHeader {}

impl AdminRequestHeader {
    pub fn new(opcode: u8, ctlid: ControllerId) -> Self {
        Self {
            typ: MSGTYPE_NVME,
            nmp: request_nmp(MessageType::AdminCommand),
            opcode,
            ctlid: ctlid.0,
            ..Default::default()
        }
    }
}

/// Admin response message header: MI status plus the completion queue entry
/// dwords the device returns.
// MI v2.0, 6.2, Figure 139
#[derive(Debug, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct AdminResponseHeader {
    typ: u8,
    #[deku(pad_bytes_after = "2")]
    nmp: u8,
    #[deku(pad_bytes_after = "3")]
    pub status: u8,
    pub cdw0: u32,
    pub cdw1: u32,
    pub cdw3: u32,
}

/// Parameters for an Admin Identify, excluding the data buffer.
#[derive(Clone, Copy, Debug, Default)]
pub struct IdentifyArgs {
    pub cns: u8,
    pub csi: u8,
    pub nsid: u32,
    pub cntid: u16,
    pub cns_specific_id: u16,
    pub uuidx: u8,
}

/// Parameters for an Admin Get Log Page, excluding the log buffer.
#[derive(Clone, Copy, Debug, Default)]
pub struct GetLogPageArgs {
    pub lid: u8,
    pub nsid: u32,
    pub lpo: u64,
    pub lsp: u8,
    pub lsi: u16,
    pub rae: bool,
    pub uuidx: u8,
    pub csi: u8,
    pub ot: bool,
}

/// Security protocol addressing shared by Security Send and Receive.
#[derive(Clone, Copy, Debug, Default)]
pub struct SecurityArgs {
    pub secp: u8,
    pub spsp0: u8,
    pub spsp1: u8,
    pub nssf: u8,
}

/// Handle to one controller reachable through an endpoint. Holds the
/// endpoint exclusively for the lifetime of the handle.
pub struct Controller<'ep> {
    ep: &'ep mut Endpoint,
    id: ControllerId,
}

impl<'ep> Controller<'ep> {
    pub(crate) fn new(ep: &'ep mut Endpoint, id: ControllerId) -> Self {
        Self { ep, id }
    }

    pub fn id(&self) -> ControllerId {
        self.id
    }

    /// One-shot Admin transfer with a caller-built request header. The
    /// response header is returned undigested; MI status interpretation is
    /// left to the caller.
    pub fn admin_xfer(
        &mut self,
        req_hdr: &mut AdminRequestHeader,
        req_data: &[u8],
        resp_offset: usize,
        resp_data: &mut [u8],
    ) -> Result<(AdminResponseHeader, usize)> {
        if resp_data.len() > ADMIN_MAX_XFER {
            return Err(Error::InvalidArgument("response size above transfer limit"));
        }

        if resp_offset > u32::MAX as usize {
            return Err(Error::InvalidArgument("response offset above 32 bits"));
        }

        if resp_offset & 0x3 != 0 {
            return Err(Error::InvalidArgument("response offset unaligned"));
        }

        // Bidirectional data is not permitted (see the DLEN definition)
        if !req_data.is_empty() && !resp_data.is_empty() {
            return Err(Error::InvalidArgument("simultaneous request and response data"));
        }

        if resp_data.is_empty() && resp_offset != 0 {
            return Err(Error::InvalidArgument("response offset without response data"));
        }

        req_hdr.typ = MSGTYPE_NVME;
        req_hdr.nmp = request_nmp(MessageType::AdminCommand);
        req_hdr.cflgs = CFLGS_DLEN | CFLGS_DOFF;
        req_hdr.dlen = resp_data.len() as u32;
        req_hdr.doff = resp_offset as u32;

        let enc = req_hdr.encode()?;
        let mut req = MiRequest::with_data(&enc.0, req_data);

        let mut resp_hdr = [0u8; ADMIN_RESP_HDR_SIZE];
        let mut resp = MiResponse::new(&mut resp_hdr, resp_data);

        self.ep.submit(&mut req, &mut resp)?;
        let data_len = resp.data_len;

        let ((_, _), rh) = AdminResponseHeader::from_bytes((&resp_hdr[..], 0))?;
        Ok((rh, data_len))
    }

    /// Admin Identify constrained to a partial structure. Returns the
    /// completion `cdw0` value; short data is treated as a protocol error
    /// since callers expect a fully-populated buffer.
    pub fn admin_identify_partial(
        &mut self,
        args: &IdentifyArgs,
        offset: usize,
        data: &mut [u8],
    ) -> Result<u32> {
        let size = data.len();
        if size == 0 || size > u32::MAX as usize {
            return Err(Error::InvalidArgument("identify size out of range"));
        }

        if offset > u32::MAX as usize {
            return Err(Error::InvalidArgument("identify offset above 32 bits"));
        }

        let mut hdr = AdminRequestHeader::new(AdminCommandOpcode::Identify as u8, self.id);
        hdr.cdw1 = args.nsid;
        hdr.cdw10 = (args.cntid as u32) << 16 | args.cns as u32;
        hdr.cdw11 = (args.csi as u32) << 24 | args.cns_specific_id as u32;
        hdr.cdw14 = args.uuidx as u32;
        hdr.dlen = size as u32;
        hdr.cflgs = CFLGS_DLEN;
        if offset != 0 {
            hdr.cflgs |= CFLGS_DOFF;
            hdr.doff = offset as u32;
        }

        let enc = hdr.encode()?;
        let mut req = MiRequest::new(&enc.0);

        let mut resp_hdr = [0u8; ADMIN_RESP_HDR_SIZE];
        let mut resp = MiResponse::new(&mut resp_hdr, data);

        self.ep.submit(&mut req, &mut resp)?;
        let data_len = resp.data_len;

        let ((_, _), rh) = AdminResponseHeader::from_bytes((&resp_hdr[..], 0))?;
        if rh.status != 0 {
            return Err(Error::Status(rh.status));
        }

        if data_len != size {
            return Err(Error::Protocol("identify returned short data"));
        }

        Ok(rh.cdw0)
    }

    /// Admin Identify of a whole data structure.
    pub fn admin_identify(&mut self, args: &IdentifyArgs, data: &mut [u8]) -> Result<u32> {
        self.admin_identify_partial(args, 0, data)
    }

    /// Identify Controller for this handle's controller.
    pub fn admin_identify_ctrl(&mut self, data: &mut [u8]) -> Result<u32> {
        if data.len() != ADMIN_MAX_XFER {
            return Err(Error::InvalidArgument("identify buffer must be 4096 bytes"));
        }
        let args = IdentifyArgs {
            cns: Cns::IdentifyController as u8,
            ..Default::default()
        };
        self.admin_identify(&args, data)
    }

    /// Identify Namespace for an active namespace on this controller.
    pub fn admin_identify_ns(&mut self, nsid: u32, data: &mut [u8]) -> Result<u32> {
        if data.len() != ADMIN_MAX_XFER {
            return Err(Error::InvalidArgument("identify buffer must be 4096 bytes"));
        }
        let args = IdentifyArgs {
            cns: Cns::NvmIdentifyNamespace as u8,
            nsid,
            ..Default::default()
        };
        self.admin_identify(&args, data)
    }

    /// Retrieve one MCTP-message-sized chunk of log page data.
    fn admin_get_log_chunk(
        &mut self,
        args: &GetLogPageArgs,
        offset: usize,
        final_xfer: bool,
        data: &mut [u8],
    ) -> Result<usize> {
        let len = data.len();
        if len < 4 || len > ADMIN_MAX_XFER {
            return Err(Error::InvalidArgument("log transfer size out of range"));
        }

        if offset > u32::MAX as usize {
            return Err(Error::InvalidArgument("log offset above 32 bits"));
        }

        let ndw = (len as u32 >> 2) - 1;
        let rae = !final_xfer || args.rae;

        let mut hdr = AdminRequestHeader::new(AdminCommandOpcode::GetLogPage as u8, self.id);
        hdr.cdw1 = args.nsid;
        hdr.cdw10 = (ndw & 0xffff) << 16
            | (rae as u32) << 15
            | (args.lsp as u32) << 8
            | args.lid as u32;
        hdr.cdw11 = (args.lsi as u32) << 16 | ndw >> 16;
        hdr.cdw12 = args.lpo as u32;
        hdr.cdw13 = (args.lpo >> 32) as u32;
        hdr.cdw14 = (args.csi as u32) << 24 | (args.ot as u32) << 23 | args.uuidx as u32;
        hdr.cflgs = CFLGS_DLEN;
        hdr.dlen = len as u32;
        if offset != 0 {
            hdr.cflgs |= CFLGS_DOFF;
            hdr.doff = offset as u32;
        }

        let enc = hdr.encode()?;
        let mut req = MiRequest::new(&enc.0);

        let mut resp_hdr = [0u8; ADMIN_RESP_HDR_SIZE];
        let mut resp = MiResponse::new(&mut resp_hdr, data);

        self.ep.submit(&mut req, &mut resp)?;
        let data_len = resp.data_len;

        let ((_, _), rh) = AdminResponseHeader::from_bytes((&resp_hdr[..], 0))?;
        if rh.status != 0 {
            return Err(Error::Status(rh.status));
        }

        Ok(data_len)
    }

    /// Admin Get Log Page over a log of arbitrary length, partitioned into
    /// transfer-limit-sized chunks. Returns the number of bytes actually
    /// received; a chunk returning short data marks the end of the log.
    pub fn admin_get_log(&mut self, args: &GetLogPageArgs, log: &mut [u8]) -> Result<usize> {
        let total = log.len();
        let mut xfer_offset = 0;

        while xfer_offset < total {
            let cur = (total - xfer_offset).min(ADMIN_MAX_XFER);
            let final_xfer = xfer_offset + cur >= total;

            let got = self.admin_get_log_chunk(
                args,
                xfer_offset,
                final_xfer,
                &mut log[xfer_offset..xfer_offset + cur],
            )?;
            xfer_offset += got;

            // Less data than requested marks the end of the log page
            if got != cur {
                break;
            }
        }

        Ok(xfer_offset)
    }

    /// Admin Security Send. Returns the completion `cdw0` value.
    pub fn admin_security_send(&mut self, args: &SecurityArgs, data: &[u8]) -> Result<u32> {
        if data.len() > ADMIN_MAX_XFER {
            return Err(Error::InvalidArgument("security payload above transfer limit"));
        }

        let mut hdr = AdminRequestHeader::new(AdminCommandOpcode::SecuritySend as u8, self.id);
        hdr.cdw10 = (args.secp as u32) << 24
            | (args.spsp0 as u32) << 16
            | (args.spsp1 as u32) << 8
            | args.nssf as u32;
        hdr.cdw11 = data.len() as u32;
        hdr.cflgs = CFLGS_DLEN;
        hdr.dlen = data.len() as u32;

        let enc = hdr.encode()?;
        let mut req = MiRequest::with_data(&enc.0, data);

        let mut resp_hdr = [0u8; ADMIN_RESP_HDR_SIZE];
        let mut none = [0u8; 0];
        let mut resp = MiResponse::new(&mut resp_hdr, &mut none);

        self.ep.submit(&mut req, &mut resp)?;

        let ((_, _), rh) = AdminResponseHeader::from_bytes((&resp_hdr[..], 0))?;
        if rh.status != 0 {
            return Err(Error::Status(rh.status));
        }

        Ok(rh.cdw0)
    }

    /// Admin Security Receive. Returns the completion `cdw0` value and the
    /// number of payload bytes received.
    pub fn admin_security_recv(
        &mut self,
        args: &SecurityArgs,
        data: &mut [u8],
    ) -> Result<(u32, usize)> {
        if data.len() > ADMIN_MAX_XFER {
            return Err(Error::InvalidArgument("security payload above transfer limit"));
        }

        let mut hdr = AdminRequestHeader::new(AdminCommandOpcode::SecurityReceive as u8, self.id);
        hdr.cdw10 = (args.secp as u32) << 24
            | (args.spsp0 as u32) << 16
            | (args.spsp1 as u32) << 8
            | args.nssf as u32;
        hdr.cdw11 = data.len() as u32;
        hdr.cflgs = CFLGS_DLEN;
        hdr.dlen = data.len() as u32;

        let enc = hdr.encode()?;
        let mut req = MiRequest::new(&enc.0);

        let mut resp_hdr = [0u8; ADMIN_RESP_HDR_SIZE];
        let mut resp = MiResponse::new(&mut resp_hdr, data);

        self.ep.submit(&mut req, &mut resp)?;
        let data_len = resp.data_len;

        let ((_, _), rh) = AdminResponseHeader::from_bytes((&resp_hdr[..], 0))?;
        if rh.status != 0 {
            return Err(Error::Status(rh.status));
        }

        Ok((rh.cdw0, data_len))
    }
}
