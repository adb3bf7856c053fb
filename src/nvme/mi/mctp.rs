// SPDX-License-Identifier: GPL-3.0-only
/*
 * Copyright (c) 2025 Code Construct
 */
use std::any::Any;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use log::{debug, error, info, warn};
use mctp::Eid;
use num_traits::FromPrimitive;

use super::{
    Endpoint, Error, MSGTYPE_NVME, MiRequest, MiResponse, RESP_HDR_SIZE, ResponseStatus, Result,
    Root, SubmitParams, Transport, mic,
};

// AF_MCTP arrived in kernel v5.15 alongside these ABI definitions; libc does
// not export them yet, so carry a local set.
const AF_MCTP: libc::c_int = 45;

const MCTP_TYPE_MIC: u8 = 0x80;

const MCTP_TAG_OWNER: u8 = 0x08;
const MCTP_TAG_PREALLOC: u8 = 0x10;

// SIOCPROTOPRIVATE + 0 / + 1
const SIOCMCTPALLOCTAG: libc::c_ulong = 0x89e0;
const SIOCMCTPDROPTAG: libc::c_ulong = 0x89e1;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct MctpAddr {
    pub s_addr: u8,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct SockaddrMctp {
    pub smctp_family: libc::c_ushort,
    pub smctp_pad0: u16,
    pub smctp_network: libc::c_uint,
    pub smctp_addr: MctpAddr,
    pub smctp_type: u8,
    pub smctp_tag: u8,
    pub smctp_pad1: u8,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct MctpIocTagCtl {
    pub peer_addr: u8,
    pub tag: u8,
    pub flags: u16,
}

/// Syscall surface used by the transport, swappable for tests.
pub(crate) trait SocketOps {
    fn socket(&mut self) -> io::Result<OwnedFd>;

    fn sendmsg(&mut self, sd: RawFd, addr: &SockaddrMctp, bufs: &[&[u8]]) -> io::Result<usize>;

    fn recvmsg(&mut self, sd: RawFd, bufs: &mut [&mut [u8]]) -> io::Result<usize>;

    fn poll(&mut self, sd: RawFd, timeout: libc::c_int) -> io::Result<i32>;

    fn ioctl_tag(
        &mut self,
        sd: RawFd,
        req: libc::c_ulong,
        ctl: &mut MctpIocTagCtl,
    ) -> io::Result<()>;
}

struct KernelSocketOps;

impl SocketOps for KernelSocketOps {
    fn socket(&mut self) -> io::Result<OwnedFd> {
        let sd = unsafe { libc::socket(AF_MCTP, libc::SOCK_DGRAM, 0) };
        if sd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(unsafe { OwnedFd::from_raw_fd(sd) })
    }

    fn sendmsg(&mut self, sd: RawFd, addr: &SockaddrMctp, bufs: &[&[u8]]) -> io::Result<usize> {
        let mut iov: Vec<libc::iovec> = bufs
            .iter()
            .map(|b| libc::iovec {
                iov_base: b.as_ptr() as *mut libc::c_void,
                iov_len: b.len(),
            })
            .collect();

        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_name = addr as *const SockaddrMctp as *mut libc::c_void;
        msg.msg_namelen = mem::size_of::<SockaddrMctp>() as libc::socklen_t;
        msg.msg_iov = iov.as_mut_ptr();
        msg.msg_iovlen = iov.len();

        let rc = unsafe { libc::sendmsg(sd, &msg, 0) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(rc as usize)
    }

    fn recvmsg(&mut self, sd: RawFd, bufs: &mut [&mut [u8]]) -> io::Result<usize> {
        let mut iov: Vec<libc::iovec> = bufs
            .iter_mut()
            .map(|b| libc::iovec {
                iov_base: b.as_mut_ptr() as *mut libc::c_void,
                iov_len: b.len(),
            })
            .collect();

        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = iov.as_mut_ptr();
        msg.msg_iovlen = iov.len();

        let rc = unsafe { libc::recvmsg(sd, &mut msg, libc::MSG_DONTWAIT) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(rc as usize)
    }

    fn poll(&mut self, sd: RawFd, timeout: libc::c_int) -> io::Result<i32> {
        let mut fds = [libc::pollfd {
            fd: sd,
            events: libc::POLLIN,
            revents: 0,
        }];
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), 1, timeout) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(rc)
    }

    fn ioctl_tag(
        &mut self,
        sd: RawFd,
        req: libc::c_ulong,
        ctl: &mut MctpIocTagCtl,
    ) -> io::Result<()> {
        let rc = unsafe { libc::ioctl(sd, req, ctl as *mut MctpIocTagCtl) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

const MIC_SIZE: usize = 4;

/// Minimal "more processing required" response: generic header, status, one
/// reserved byte, MPRT.
const MPR_RESP_SIZE: usize = 8;

/// MCTP datagram transport state for one endpoint.
pub struct MctpTransport {
    net: i32,
    eid: Eid,
    sd: OwnedFd,
    ops: Box<dyn SocketOps>,
    alloc_tag_logged: bool,
}

impl MctpTransport {
    pub fn new(net: i32, eid: Eid) -> Result<Self> {
        Self::with_ops(net, eid, Box::new(KernelSocketOps))
    }

    pub(crate) fn with_ops(net: i32, eid: Eid, mut ops: Box<dyn SocketOps>) -> Result<Self> {
        let sd = ops.socket().map_err(Error::Resource)?;
        Ok(Self {
            net,
            eid,
            sd,
            ops,
            alloc_tag_logged: false,
        })
    }

    pub fn net(&self) -> i32 {
        self.net
    }

    pub fn eid(&self) -> Eid {
        self.eid
    }

    fn addr(&self, tag: u8) -> SockaddrMctp {
        SockaddrMctp {
            smctp_family: AF_MCTP as libc::c_ushort,
            smctp_network: self.net as libc::c_uint,
            smctp_addr: MctpAddr {
                s_addr: self.eid.0,
            },
            smctp_type: mctp::MCTP_TYPE_NVME.0 | MCTP_TYPE_MIC,
            smctp_tag: tag,
            ..Default::default()
        }
    }

    fn tag_alloc(&mut self) -> u8 {
        let mut ctl = MctpIocTagCtl {
            peer_addr: self.eid.0,
            ..Default::default()
        };

        match self
            .ops
            .ioctl_tag(self.sd.as_raw_fd(), SIOCMCTPALLOCTAG, &mut ctl)
        {
            Ok(()) => ctl.tag,
            Err(_) => {
                if !self.alloc_tag_logged {
                    // Not fatal, but without a preallocated tag we cannot
                    // span "more processing required" replies
                    info!("System does not support explicit tag allocation");
                    self.alloc_tag_logged = true;
                }
                MCTP_TAG_OWNER
            }
        }
    }

    fn tag_drop(&mut self, tag: u8) {
        if tag & MCTP_TAG_PREALLOC == 0 {
            return;
        }

        let mut ctl = MctpIocTagCtl {
            peer_addr: self.eid.0,
            tag,
            flags: 0,
        };
        let _ = self
            .ops
            .ioctl_tag(self.sd.as_raw_fd(), SIOCMCTPDROPTAG, &mut ctl);
    }

    fn submit_tagged(
        &mut self,
        params: &SubmitParams,
        req: &MiRequest,
        resp: &mut MiResponse,
        tag: u8,
    ) -> Result<()> {
        let sd = self.sd.as_raw_fd();
        let addr = self.addr(tag);
        let req_mic = req.mic.to_le_bytes();

        let mut send_bufs: Vec<&[u8]> = Vec::with_capacity(3);
        // The wire omits the leading byte; the MCTP layer carries the type
        send_bufs.push(&req.hdr[1..]);
        if !req.data.is_empty() {
            send_bufs.push(req.data);
        }
        send_bufs.push(&req_mic);

        self.ops.sendmsg(sd, &addr, &send_bufs).map_err(|err| {
            error!("Failure sending MCTP message: {err}");
            Error::Io(err)
        })?;

        let mut timeout: libc::c_int = if params.timeout == 0 {
            -1
        } else {
            params.timeout as libc::c_int
        };

        let mut mic_buf = [0u8; MIC_SIZE];

        let len = loop {
            loop {
                match self.ops.poll(sd, timeout) {
                    Ok(0) => {
                        debug!("Timeout on MCTP socket");
                        return Err(Error::Timeout);
                    }
                    Ok(_) => break,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        error!("Failed polling on MCTP socket: {err}");
                        return Err(Error::Io(err));
                    }
                }
            }

            let rlen = {
                let mut recv_bufs: [&mut [u8]; 3] =
                    [&mut resp.hdr[1..], &mut resp.data[..], &mut mic_buf];
                self.ops.recvmsg(sd, &mut recv_bufs).map_err(|err| {
                    error!("Failure receiving MCTP message: {err}");
                    Error::Io(err)
                })?
            };

            if rlen == 0 {
                warn!("No data from MCTP endpoint");
                return Err(Error::Io(io::Error::from_raw_os_error(libc::EIO)));
            }

            // Re-add the type byte, so we can work on aligned lengths here on
            resp.hdr[0] = MSGTYPE_NVME;
            let len = rlen + 1;

            // The smallest response is the 4-byte generic header plus four
            // bytes of error data, excluding the MIC
            if len < RESP_HDR_SIZE + MIC_SIZE {
                error!("Invalid MCTP response: too short ({len} bytes)");
                return Err(Error::Protocol("response too short"));
            }

            // Header and payload data are always multiples of 4 bytes
            if len & 0x3 != 0 {
                warn!("Response message has unaligned length ({len})");
                return Err(Error::Protocol("unaligned response length"));
            }

            // A More Processing Required notification keeps the tag live and
            // retries the receive with the device-requested wait
            if let Some(mprt) = resp_is_mpr(resp, len, &mic_buf) {
                debug!("Received More Processing Required, waiting for response");

                // Without an MPRT from the device, fall back to the
                // command/response timeout, or the largest possible MPRT
                let mut mpr_time = if mprt != 0 {
                    mprt
                } else if params.timeout != 0 {
                    params.timeout
                } else {
                    0xffff
                };

                if params.mprt_max != 0 && mpr_time > params.mprt_max {
                    mpr_time = params.mprt_max;
                }

                timeout = mpr_time as libc::c_int;
                continue;
            }

            break len;
        };

        // Find the MIC and the header/data split. The split is 4-byte
        // aligned, so the MIC sits entirely within one buffer.
        let hdr_cap = resp.hdr.len();
        let data_cap = resp.data.len();

        if len == hdr_cap + data_cap + MIC_SIZE {
            // Expected length; header, data and MIC are laid out already
            resp.hdr_len = hdr_cap;
            resp.data_len = data_cap;
            resp.mic = u32::from_le_bytes(mic_buf);
        } else if len < hdr_cap + MIC_SIZE {
            // Shorter than the expected header; the MIC is in the header buf
            resp.hdr_len = len - MIC_SIZE;
            resp.data_len = 0;
            let tail: [u8; MIC_SIZE] = resp.hdr[resp.hdr_len..resp.hdr_len + MIC_SIZE]
                .try_into()
                .map_err(|_| Error::Protocol("response layout"))?;
            resp.mic = u32::from_le_bytes(tail);
        } else {
            // Full header, truncated data; the MIC is in the data buf
            resp.hdr_len = hdr_cap;
            resp.data_len = len - hdr_cap - MIC_SIZE;
            let tail: [u8; MIC_SIZE] = resp.data[resp.data_len..resp.data_len + MIC_SIZE]
                .try_into()
                .map_err(|_| Error::Protocol("response layout"))?;
            resp.mic = u32::from_le_bytes(tail);
        }

        Ok(())
    }
}

/// Check whether a received message is a More Processing Required
/// notification; if so, return the worst-case processing time in
/// milliseconds.
///
/// This pre-checks the MIC and inspects header fields below the submission
/// engine, but the check has to happen here to keep the tag allocated while
/// the receive is retried.
fn resp_is_mpr(resp: &MiResponse, len: usize, mic_buf: &[u8; MIC_SIZE]) -> Option<u32> {
    if len != MPR_RESP_SIZE + MIC_SIZE {
        return None;
    }

    // The response has not been laid out yet: the body is linear in the
    // header buffer, and the MIC landed in whichever buffer followed it.
    let body = &resp.hdr[..MPR_RESP_SIZE.min(resp.hdr.len())];
    if body.len() < MPR_RESP_SIZE {
        return None;
    }

    if ResponseStatus::from_u8(body[4]) != Some(ResponseStatus::MoreProcessingRequired) {
        return None;
    }

    let mic = if resp.hdr.len() > MPR_RESP_SIZE {
        u32::from_le_bytes(resp.hdr[MPR_RESP_SIZE..MPR_RESP_SIZE + MIC_SIZE].try_into().ok()?)
    } else if resp.data.len() >= MIC_SIZE {
        u32::from_le_bytes(resp.data[..MIC_SIZE].try_into().ok()?)
    } else {
        u32::from_le_bytes(*mic_buf)
    };

    if mic != mic::message_integrity_check(body, &[]) {
        return None;
    }

    // MPRT is in units of 100ms, read in wire (little-endian) order
    let mprt = u16::from_le_bytes([body[6], body[7]]);
    Some(mprt as u32 * 100)
}

impl Transport for MctpTransport {
    fn name(&self) -> &'static str {
        "mctp"
    }

    fn mic_enabled(&self) -> bool {
        true
    }

    fn submit(
        &mut self,
        params: &SubmitParams,
        req: &MiRequest,
        resp: &mut MiResponse,
    ) -> Result<()> {
        // Enough space for at least a generic (/error) response
        if resp.hdr.len() < RESP_HDR_SIZE {
            return Err(Error::InvalidArgument("response header below minimum"));
        }

        let tag = self.tag_alloc();
        let rc = self.submit_tagged(params, req, resp, tag);
        self.tag_drop(tag);
        rc
    }

    fn desc_ep(&self) -> String {
        format!("net {} eid {}", self.net, self.eid.0)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Assuming an i2c transport at 100kHz with the smallest MTU and worst-case
/// clock stretching, a command/response pair can take up to 1.6s. Allowing
/// for a retry or two handled by lower layers, 5s is a reasonable timeout.
const MCTP_DEFAULT_TIMEOUT_MS: u32 = 5000;

impl Root {
    /// Open an endpoint to `(net, eid)` over an MCTP datagram socket.
    pub fn open_mctp(&mut self, net: i32, eid: Eid) -> Result<&mut Endpoint> {
        self.open_mctp_ops(net, eid, Box::new(KernelSocketOps))
    }

    pub(crate) fn open_mctp_ops(
        &mut self,
        net: i32,
        eid: Eid,
        ops: Box<dyn SocketOps>,
    ) -> Result<&mut Endpoint> {
        let transport = MctpTransport::with_ops(net, eid, ops)?;
        let ep = self.init_endpoint(Box::new(transport));
        ep.set_timeout(MCTP_DEFAULT_TIMEOUT_MS)?;
        Ok(ep)
    }
}
