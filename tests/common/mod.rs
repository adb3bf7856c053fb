// SPDX-License-Identifier: GPL-3.0-only
/*
 * Copyright (c) 2025 Code Construct
 */
#![allow(dead_code)]
extern crate simplelog;

use std::any::Any;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crc::{CRC_32_ISCSI, Crc};
use log::LevelFilter;
use nvme_mi_host::nvme::mi::{
    Endpoint, Error, MiRequest, MiResponse, Result, SubmitParams, Transport,
};
use simplelog::{ColorChoice, Config, TermLogger, TerminalMode};

const ISCSI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

pub fn setup() {
    let _ = TermLogger::init(
        LevelFilter::Debug,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    );
}

pub fn mic_of(hdr: &[u8], data: &[u8]) -> u32 {
    let mut digest = ISCSI.digest();
    digest.update(hdr);
    digest.update(data);
    digest.finalize()
}

pub struct RecordedRequest {
    pub hdr: Vec<u8>,
    pub data: Vec<u8>,
    pub mic: u32,
}

pub struct ScriptedResponse {
    pub hdr: Vec<u8>,
    pub data: Vec<u8>,
    pub corrupt_mic: bool,
}

impl ScriptedResponse {
    pub fn new(hdr: Vec<u8>, data: Vec<u8>) -> Self {
        Self {
            hdr,
            data,
            corrupt_mic: false,
        }
    }

    pub fn corrupted(hdr: Vec<u8>, data: Vec<u8>) -> Self {
        Self {
            hdr,
            data,
            corrupt_mic: true,
        }
    }
}

#[derive(Default)]
pub struct MockState {
    pub requests: Vec<RecordedRequest>,
    pub responses: VecDeque<ScriptedResponse>,
}

/// Transport double: records submitted requests and lays out scripted
/// responses with a valid integrity check.
pub struct MockTransport(pub Rc<RefCell<MockState>>);

impl Transport for MockTransport {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn mic_enabled(&self) -> bool {
        true
    }

    fn submit(
        &mut self,
        _params: &SubmitParams,
        req: &MiRequest,
        resp: &mut MiResponse,
    ) -> Result<()> {
        let mut st = self.0.borrow_mut();
        st.requests.push(RecordedRequest {
            hdr: req.hdr.to_vec(),
            data: req.data.to_vec(),
            mic: req.mic,
        });

        let Some(s) = st.responses.pop_front() else {
            return Err(Error::Timeout);
        };

        resp.hdr[..s.hdr.len()].copy_from_slice(&s.hdr);
        resp.hdr_len = s.hdr.len();
        resp.data[..s.data.len()].copy_from_slice(&s.data);
        resp.data_len = s.data.len();

        let mut mic = mic_of(&s.hdr, &s.data);
        if s.corrupt_mic {
            mic = !mic;
        }
        resp.mic = mic;
        Ok(())
    }

    fn desc_ep(&self) -> String {
        "scripted".into()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub fn mock_endpoint() -> (Endpoint, Rc<RefCell<MockState>>) {
    let state = Rc::new(RefCell::new(MockState::default()));
    let ep = Endpoint::new(Box::new(MockTransport(state.clone())));
    (ep, state)
}

/// MI command response header: status and `nmresp` behind the generic header.
pub fn mi_resp_hdr(status: u8, nmresp: [u8; 3]) -> Vec<u8> {
    vec![
        0x84, 0x88, 0x00, 0x00, status, nmresp[0], nmresp[1], nmresp[2],
    ]
}

/// Admin response header: status plus completion dwords 0, 1 and 3.
pub fn admin_resp_hdr(status: u8, cdw0: u32) -> Vec<u8> {
    let mut v = vec![0x84, 0x90, 0x00, 0x00, status, 0x00, 0x00, 0x00];
    v.extend_from_slice(&cdw0.to_le_bytes());
    v.extend_from_slice(&[0u8; 8]);
    v
}
