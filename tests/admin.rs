// SPDX-License-Identifier: GPL-3.0-only
/*
 * Copyright (c) 2025 Code Construct
 */
mod common;

use common::{ScriptedResponse, admin_resp_hdr, mock_endpoint, setup};
use nvme_mi_host::nvme::mi::admin::{
    AdminRequestHeader, GetLogPageArgs, IdentifyArgs, SecurityArgs,
};
use nvme_mi_host::nvme::mi::{ControllerId, Error};
use nvme_mi_host::nvme::Cns;

// Admin request header field offsets
const OFF_OPCODE: usize = 4;
const OFF_CFLGS: usize = 5;
const OFF_CTLID: usize = 6;
const OFF_CDW1: usize = 8;
const OFF_DOFF: usize = 28;
const OFF_DLEN: usize = 32;
const OFF_CDW10: usize = 44;
const OFF_CDW11: usize = 48;

fn dword(hdr: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(hdr[off..off + 4].try_into().unwrap())
}

mod identify {
    use super::*;

    #[test]
    fn identify_controller() {
        setup();
        let (mut ep, state) = mock_endpoint();
        state.borrow_mut().responses.push_back(ScriptedResponse::new(
            admin_resp_hdr(0, 0),
            vec![0u8; 4096],
        ));

        let mut ctrl = ep.init_controller(ControllerId(0));
        let args = IdentifyArgs {
            cns: Cns::IdentifyController as u8,
            ..Default::default()
        };
        let mut buf = [0u8; 4096];
        let result = ctrl.admin_identify_partial(&args, 0, &mut buf).unwrap();
        assert_eq!(result, 0);

        let st = state.borrow();
        assert_eq!(st.requests.len(), 1);
        let hdr = &st.requests[0].hdr;
        assert_eq!(hdr.len(), 68);
        assert_eq!(hdr[0], 0x84);
        assert_eq!(hdr[1], 0x10);
        assert_eq!(hdr[OFF_OPCODE], 0x06);
        // DLEN valid, no DOFF
        assert_eq!(hdr[OFF_CFLGS], 0x01);
        assert_eq!(&hdr[OFF_CTLID..OFF_CTLID + 2], &[0x00, 0x00]);
        assert_eq!(dword(hdr, OFF_CDW1), 0);
        assert_eq!(dword(hdr, OFF_CDW10), 0x0000_0001);
        assert_eq!(dword(hdr, OFF_CDW11), 0);
        assert_eq!(dword(hdr, OFF_DLEN), 0x1000);
        assert_eq!(dword(hdr, OFF_DOFF), 0);
    }

    #[test]
    fn offset_sets_doff_flag() {
        setup();
        let (mut ep, state) = mock_endpoint();
        state.borrow_mut().responses.push_back(ScriptedResponse::new(
            admin_resp_hdr(0, 0),
            vec![0u8; 512],
        ));

        let mut ctrl = ep.init_controller(ControllerId(5));
        let args = IdentifyArgs {
            cns: Cns::IdentifyController as u8,
            cntid: 5,
            ..Default::default()
        };
        let mut buf = [0u8; 512];
        ctrl.admin_identify_partial(&args, 1024, &mut buf).unwrap();

        let st = state.borrow();
        let hdr = &st.requests[0].hdr;
        assert_eq!(hdr[OFF_CFLGS], 0x03);
        assert_eq!(&hdr[OFF_CTLID..OFF_CTLID + 2], &[0x05, 0x00]);
        assert_eq!(dword(hdr, OFF_DOFF), 1024);
        assert_eq!(dword(hdr, OFF_CDW10), 0x0005_0001);
    }

    #[test]
    fn short_data_is_protocol_error() {
        setup();
        let (mut ep, state) = mock_endpoint();
        state.borrow_mut().responses.push_back(ScriptedResponse::new(
            admin_resp_hdr(0, 0),
            vec![0u8; 512],
        ));

        let mut ctrl = ep.init_controller(ControllerId(0));
        let args = IdentifyArgs {
            cns: Cns::IdentifyController as u8,
            ..Default::default()
        };
        let mut buf = [0u8; 4096];
        assert!(matches!(
            ctrl.admin_identify_partial(&args, 0, &mut buf),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn empty_buffer_rejected() {
        setup();
        let (mut ep, _state) = mock_endpoint();
        let mut ctrl = ep.init_controller(ControllerId(0));
        let args = IdentifyArgs::default();
        let mut buf = [0u8; 0];
        assert!(matches!(
            ctrl.admin_identify_partial(&args, 0, &mut buf),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn status_propagates_verbatim() {
        setup();
        let (mut ep, state) = mock_endpoint();
        state
            .borrow_mut()
            .responses
            .push_back(ScriptedResponse::new(admin_resp_hdr(0x04, 0), vec![]));

        let mut ctrl = ep.init_controller(ControllerId(0));
        let args = IdentifyArgs::default();
        let mut buf = [0u8; 4096];
        assert!(matches!(
            ctrl.admin_identify_partial(&args, 0, &mut buf),
            Err(Error::Status(0x04))
        ));
    }

    #[test]
    fn whole_structure_wrapper_requires_page_buffer() {
        setup();
        let (mut ep, _state) = mock_endpoint();
        let mut ctrl = ep.init_controller(ControllerId(0));
        let mut buf = [0u8; 512];
        assert!(matches!(
            ctrl.admin_identify_ctrl(&mut buf),
            Err(Error::InvalidArgument(_))
        ));
    }
}

mod get_log_page {
    use super::*;

    #[test]
    fn single_transfer() {
        setup();
        let (mut ep, state) = mock_endpoint();
        state.borrow_mut().responses.push_back(ScriptedResponse::new(
            admin_resp_hdr(0, 0),
            vec![0x5a; 512],
        ));

        let mut ctrl = ep.init_controller(ControllerId(0));
        let args = GetLogPageArgs {
            lid: 0x02,
            ..Default::default()
        };
        let mut log = [0u8; 512];
        let len = ctrl.admin_get_log(&args, &mut log).unwrap();
        assert_eq!(len, 512);
        assert!(log.iter().all(|b| *b == 0x5a));

        let st = state.borrow();
        assert_eq!(st.requests.len(), 1);
        let hdr = &st.requests[0].hdr;
        assert_eq!(hdr[OFF_OPCODE], 0x02);
        // NDW 127, RAE clear on the final transfer, LID in the low byte
        assert_eq!(dword(hdr, OFF_CDW10), 127 << 16 | 0x02);
        assert_eq!(dword(hdr, OFF_DLEN), 512);
    }

    #[test]
    fn partitions_across_transfer_limit() {
        setup();
        let (mut ep, state) = mock_endpoint();
        {
            let mut st = state.borrow_mut();
            st.responses.push_back(ScriptedResponse::new(
                admin_resp_hdr(0, 0),
                vec![0x11; 4096],
            ));
            st.responses.push_back(ScriptedResponse::new(
                admin_resp_hdr(0, 0),
                vec![0x22; 4096],
            ));
            st.responses.push_back(ScriptedResponse::new(
                admin_resp_hdr(0, 0),
                vec![0x33; 808],
            ));
        }

        let mut ctrl = ep.init_controller(ControllerId(0));
        let args = GetLogPageArgs {
            lid: 0x02,
            ..Default::default()
        };
        let mut log = [0u8; 9000];
        let len = ctrl.admin_get_log(&args, &mut log).unwrap();
        assert_eq!(len, 9000);
        assert_eq!(log[0], 0x11);
        assert_eq!(log[4096], 0x22);
        assert_eq!(log[8192], 0x33);

        let st = state.borrow();
        assert_eq!(st.requests.len(), 3);

        let first = &st.requests[0].hdr;
        assert_eq!(dword(first, OFF_CDW10), 1023 << 16 | 1 << 15 | 0x02);
        assert_eq!(dword(first, OFF_DLEN), 4096);
        assert_eq!(dword(first, OFF_DOFF), 0);
        assert_eq!(first[OFF_CFLGS], 0x01);

        let second = &st.requests[1].hdr;
        assert_eq!(dword(second, OFF_CDW10), 1023 << 16 | 1 << 15 | 0x02);
        assert_eq!(dword(second, OFF_DOFF), 4096);
        assert_eq!(second[OFF_CFLGS], 0x03);

        let last = &st.requests[2].hdr;
        // 808 bytes: NDW 201, RAE clear
        assert_eq!(dword(last, OFF_CDW10), 201 << 16 | 0x02);
        assert_eq!(dword(last, OFF_DLEN), 808);
        assert_eq!(dword(last, OFF_DOFF), 8192);
    }

    #[test]
    fn short_chunk_ends_log() {
        setup();
        let (mut ep, state) = mock_endpoint();
        {
            let mut st = state.borrow_mut();
            st.responses.push_back(ScriptedResponse::new(
                admin_resp_hdr(0, 0),
                vec![0x11; 4096],
            ));
            st.responses.push_back(ScriptedResponse::new(
                admin_resp_hdr(0, 0),
                vec![0x22; 296],
            ));
        }

        let mut ctrl = ep.init_controller(ControllerId(0));
        let args = GetLogPageArgs {
            lid: 0x02,
            ..Default::default()
        };
        let mut log = [0u8; 8192];
        let len = ctrl.admin_get_log(&args, &mut log).unwrap();
        assert_eq!(len, 4392);
        assert_eq!(state.borrow().requests.len(), 2);
    }

    #[test]
    fn rae_survives_final_transfer() {
        setup();
        let (mut ep, state) = mock_endpoint();
        state.borrow_mut().responses.push_back(ScriptedResponse::new(
            admin_resp_hdr(0, 0),
            vec![0u8; 512],
        ));

        let mut ctrl = ep.init_controller(ControllerId(0));
        let args = GetLogPageArgs {
            lid: 0x02,
            rae: true,
            ..Default::default()
        };
        let mut log = [0u8; 512];
        ctrl.admin_get_log(&args, &mut log).unwrap();

        let st = state.borrow();
        assert_eq!(dword(&st.requests[0].hdr, OFF_CDW10), 127 << 16 | 1 << 15 | 0x02);
    }

    #[test]
    fn failed_chunk_aborts_loop() {
        setup();
        let (mut ep, state) = mock_endpoint();
        state
            .borrow_mut()
            .responses
            .push_back(ScriptedResponse::new(admin_resp_hdr(0x02, 0), vec![]));

        let mut ctrl = ep.init_controller(ControllerId(0));
        let args = GetLogPageArgs {
            lid: 0x02,
            ..Default::default()
        };
        let mut log = [0u8; 8192];
        assert!(matches!(
            ctrl.admin_get_log(&args, &mut log),
            Err(Error::Status(0x02))
        ));
        assert_eq!(state.borrow().requests.len(), 1);
    }
}

mod security {
    use super::*;

    #[test]
    fn send_carries_payload() {
        setup();
        let (mut ep, state) = mock_endpoint();
        state
            .borrow_mut()
            .responses
            .push_back(ScriptedResponse::new(admin_resp_hdr(0, 0xabcd), vec![]));

        let mut ctrl = ep.init_controller(ControllerId(0));
        let args = SecurityArgs {
            secp: 0xea,
            spsp0: 0x01,
            spsp1: 0x02,
            nssf: 0x03,
        };
        let payload = [0x10, 0x20, 0x30, 0x40];
        let result = ctrl.admin_security_send(&args, &payload).unwrap();
        assert_eq!(result, 0xabcd);

        let st = state.borrow();
        let hdr = &st.requests[0].hdr;
        assert_eq!(hdr[OFF_OPCODE], 0x81);
        assert_eq!(dword(hdr, OFF_CDW10), 0xea01_0203);
        assert_eq!(dword(hdr, OFF_CDW11), 4);
        assert_eq!(dword(hdr, OFF_DLEN), 4);
        assert_eq!(st.requests[0].data, payload);
    }

    #[test]
    fn receive_returns_payload_length() {
        setup();
        let (mut ep, state) = mock_endpoint();
        state.borrow_mut().responses.push_back(ScriptedResponse::new(
            admin_resp_hdr(0, 0x55aa),
            vec![0x77; 16],
        ));

        let mut ctrl = ep.init_controller(ControllerId(0));
        let args = SecurityArgs {
            secp: 0xea,
            ..Default::default()
        };
        let mut buf = [0u8; 64];
        let (result, len) = ctrl.admin_security_recv(&args, &mut buf).unwrap();
        assert_eq!(result, 0x55aa);
        assert_eq!(len, 16);
        assert!(buf[..16].iter().all(|b| *b == 0x77));

        let st = state.borrow();
        assert_eq!(st.requests[0].hdr[OFF_OPCODE], 0x82);
        assert!(st.requests[0].data.is_empty());
    }

    #[test]
    fn oversized_payload_rejected() {
        setup();
        let (mut ep, _state) = mock_endpoint();
        let mut ctrl = ep.init_controller(ControllerId(0));
        let args = SecurityArgs::default();
        let payload = [0u8; 4100];
        assert!(matches!(
            ctrl.admin_security_send(&args, &payload),
            Err(Error::InvalidArgument(_))
        ));
    }
}

mod xfer {
    use super::*;

    #[test]
    fn forces_framing_fields() {
        setup();
        let (mut ep, state) = mock_endpoint();
        state.borrow_mut().responses.push_back(ScriptedResponse::new(
            admin_resp_hdr(0x07, 0),
            vec![0u8; 16],
        ));

        let mut ctrl = ep.init_controller(ControllerId(2));
        let mut hdr = AdminRequestHeader::new(0x0a, ControllerId(2));
        let mut resp_data = [0u8; 16];
        let (rh, len) = ctrl.admin_xfer(&mut hdr, &[], 0, &mut resp_data).unwrap();

        // Status is handed back undigested
        assert_eq!(rh.status, 0x07);
        assert_eq!(len, 16);

        let st = state.borrow();
        let sent = &st.requests[0].hdr;
        assert_eq!(sent[OFF_OPCODE], 0x0a);
        assert_eq!(sent[OFF_CFLGS], 0x03);
        assert_eq!(dword(sent, OFF_DLEN), 16);
        assert_eq!(dword(sent, OFF_DOFF), 0);
    }

    #[test]
    fn oversized_response_rejected() {
        setup();
        let (mut ep, _state) = mock_endpoint();
        let mut ctrl = ep.init_controller(ControllerId(0));
        let mut hdr = AdminRequestHeader::new(0x0a, ControllerId(0));
        let mut resp_data = [0u8; 4100];
        assert!(matches!(
            ctrl.admin_xfer(&mut hdr, &[], 0, &mut resp_data),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn unaligned_offset_rejected() {
        setup();
        let (mut ep, _state) = mock_endpoint();
        let mut ctrl = ep.init_controller(ControllerId(0));
        let mut hdr = AdminRequestHeader::new(0x0a, ControllerId(0));
        let mut resp_data = [0u8; 16];
        assert!(matches!(
            ctrl.admin_xfer(&mut hdr, &[], 6, &mut resp_data),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn bidirectional_data_rejected() {
        setup();
        let (mut ep, _state) = mock_endpoint();
        let mut ctrl = ep.init_controller(ControllerId(0));
        let mut hdr = AdminRequestHeader::new(0x0a, ControllerId(0));
        let req_data = [0u8; 4];
        let mut resp_data = [0u8; 4];
        assert!(matches!(
            ctrl.admin_xfer(&mut hdr, &req_data, 0, &mut resp_data),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn offset_without_response_data_rejected() {
        setup();
        let (mut ep, _state) = mock_endpoint();
        let mut ctrl = ep.init_controller(ControllerId(0));
        let mut hdr = AdminRequestHeader::new(0x0a, ControllerId(0));
        let mut resp_data = [0u8; 0];
        assert!(matches!(
            ctrl.admin_xfer(&mut hdr, &[], 4, &mut resp_data),
            Err(Error::InvalidArgument(_))
        ));
    }
}
