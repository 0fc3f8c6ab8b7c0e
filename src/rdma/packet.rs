//! RoCEv2 RC packet wire format: BTH (12B), optional RETH (16B), optional
//! AETH (4B), optional immediate (4B), payload, trailing pad (§6).
//!
//! The original's `rocev2/formats.h` carried no concrete bitfield layout;
//! this module defines one explicitly, documented in `DESIGN.md`.

pub const BTH_LEN: usize = 12;
pub const RETH_LEN: usize = 16;
pub const AETH_LEN: usize = 4;
pub const IMMEDIATE_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RdmaOpcode {
    RcSendFirst,
    RcSendMiddle,
    RcSendLast,
    RcSendLastImm,
    RcSendOnly,
    RcSendOnlyImm,
    RcWriteFirst,
    RcWriteMiddle,
    RcWriteLast,
    RcWriteLastImm,
    RcWriteOnly,
    RcWriteOnlyImm,
    RcReadRequest,
    RcReadResponseFirst,
    RcReadResponseMiddle,
    RcReadResponseLast,
    RcReadResponseOnly,
    RcAck,
}

impl RdmaOpcode {
    pub fn to_wire(self) -> u8 {
        match self {
            RdmaOpcode::RcSendFirst => 0x00,
            RdmaOpcode::RcSendMiddle => 0x01,
            RdmaOpcode::RcSendLast => 0x02,
            RdmaOpcode::RcSendLastImm => 0x03,
            RdmaOpcode::RcSendOnly => 0x04,
            RdmaOpcode::RcSendOnlyImm => 0x05,
            RdmaOpcode::RcWriteFirst => 0x06,
            RdmaOpcode::RcWriteMiddle => 0x07,
            RdmaOpcode::RcWriteLast => 0x08,
            RdmaOpcode::RcWriteLastImm => 0x09,
            RdmaOpcode::RcWriteOnly => 0x0A,
            RdmaOpcode::RcWriteOnlyImm => 0x0B,
            RdmaOpcode::RcReadRequest => 0x0C,
            RdmaOpcode::RcReadResponseFirst => 0x0D,
            RdmaOpcode::RcReadResponseMiddle => 0x0E,
            RdmaOpcode::RcReadResponseLast => 0x0F,
            RdmaOpcode::RcReadResponseOnly => 0x10,
            RdmaOpcode::RcAck => 0x11,
        }
    }

    pub fn from_wire(byte: u8) -> Option<Self> {
        Some(match byte {
            0x00 => RdmaOpcode::RcSendFirst,
            0x01 => RdmaOpcode::RcSendMiddle,
            0x02 => RdmaOpcode::RcSendLast,
            0x03 => RdmaOpcode::RcSendLastImm,
            0x04 => RdmaOpcode::RcSendOnly,
            0x05 => RdmaOpcode::RcSendOnlyImm,
            0x06 => RdmaOpcode::RcWriteFirst,
            0x07 => RdmaOpcode::RcWriteMiddle,
            0x08 => RdmaOpcode::RcWriteLast,
            0x09 => RdmaOpcode::RcWriteLastImm,
            0x0A => RdmaOpcode::RcWriteOnly,
            0x0B => RdmaOpcode::RcWriteOnlyImm,
            0x0C => RdmaOpcode::RcReadRequest,
            0x0D => RdmaOpcode::RcReadResponseFirst,
            0x0E => RdmaOpcode::RcReadResponseMiddle,
            0x0F => RdmaOpcode::RcReadResponseLast,
            0x10 => RdmaOpcode::RcReadResponseOnly,
            0x11 => RdmaOpcode::RcAck,
            _ => return None,
        })
    }

    pub fn has_immediate_variant(self) -> bool {
        matches!(
            self,
            RdmaOpcode::RcSendLastImm
                | RdmaOpcode::RcSendOnlyImm
                | RdmaOpcode::RcWriteLastImm
                | RdmaOpcode::RcWriteOnlyImm
        )
    }

    pub fn carries_reth(self) -> bool {
        matches!(
            self,
            RdmaOpcode::RcWriteFirst
                | RdmaOpcode::RcWriteOnly
                | RdmaOpcode::RcWriteOnlyImm
                | RdmaOpcode::RcReadRequest
        )
    }

    pub fn carries_aeth(self) -> bool {
        matches!(
            self,
            RdmaOpcode::RcAck | RdmaOpcode::RcReadResponseFirst | RdmaOpcode::RcReadResponseOnly
        )
    }
}

pub fn opcode_is_first(opcode: RdmaOpcode) -> bool {
    matches!(
        opcode,
        RdmaOpcode::RcSendFirst
            | RdmaOpcode::RcWriteFirst
            | RdmaOpcode::RcReadResponseFirst
            | RdmaOpcode::RcSendOnly
            | RdmaOpcode::RcSendOnlyImm
            | RdmaOpcode::RcWriteOnly
            | RdmaOpcode::RcWriteOnlyImm
            | RdmaOpcode::RcReadResponseOnly
    )
}

pub fn opcode_is_last(opcode: RdmaOpcode) -> bool {
    matches!(
        opcode,
        RdmaOpcode::RcSendLast
            | RdmaOpcode::RcSendLastImm
            | RdmaOpcode::RcWriteLast
            | RdmaOpcode::RcWriteLastImm
            | RdmaOpcode::RcReadResponseLast
            | RdmaOpcode::RcSendOnly
            | RdmaOpcode::RcSendOnlyImm
            | RdmaOpcode::RcWriteOnly
            | RdmaOpcode::RcWriteOnlyImm
            | RdmaOpcode::RcReadResponseOnly
    )
}

pub fn opcode_is_only(opcode: RdmaOpcode) -> bool {
    matches!(
        opcode,
        RdmaOpcode::RcSendOnly
            | RdmaOpcode::RcSendOnlyImm
            | RdmaOpcode::RcWriteOnly
            | RdmaOpcode::RcWriteOnlyImm
            | RdmaOpcode::RcReadResponseOnly
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AethSyndrome {
    Ack,
    RnrNak,
    PsnSeqError,
    InvalidRequest,
    RemoteAccessError,
    RemoteOperationError,
}

impl AethSyndrome {
    fn to_wire(self) -> u8 {
        match self {
            AethSyndrome::Ack => 0,
            AethSyndrome::RnrNak => 1,
            AethSyndrome::PsnSeqError => 2,
            AethSyndrome::InvalidRequest => 3,
            AethSyndrome::RemoteAccessError => 4,
            AethSyndrome::RemoteOperationError => 5,
        }
    }

    fn from_wire(byte: u8) -> Self {
        match byte {
            0 => AethSyndrome::Ack,
            1 => AethSyndrome::RnrNak,
            2 => AethSyndrome::PsnSeqError,
            3 => AethSyndrome::InvalidRequest,
            4 => AethSyndrome::RemoteAccessError,
            _ => AethSyndrome::RemoteOperationError,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BthFields {
    pub opcode: RdmaOpcode,
    pub solicited_event: bool,
    pub pad_count: u8,
    pub dest_qp: u32,
    pub ack_request: bool,
    pub psn: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct RethFields {
    pub virtual_address: u64,
    pub rkey: u32,
    pub dma_length: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct AethFields {
    pub syndrome: AethSyndrome,
    pub msn: u32,
}

#[derive(Default)]
pub struct RdmaPacketBuilder {
    opcode: Option<RdmaOpcode>,
    dest_qp: u32,
    psn: u32,
    pad_count: u8,
    solicited_event: bool,
    ack_request: bool,
    reth: Option<RethFields>,
    aeth: Option<AethFields>,
    immediate: Option<u32>,
    payload: Vec<u8>,
}

impl RdmaPacketBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_opcode(mut self, opcode: RdmaOpcode) -> Self {
        self.opcode = Some(opcode);
        self
    }

    pub fn set_dest_qp(mut self, dest_qp: u32) -> Self {
        self.dest_qp = dest_qp;
        self
    }

    pub fn set_psn(mut self, psn: u32) -> Self {
        self.psn = psn;
        self
    }

    pub fn set_pad_count(mut self, pad_count: u8) -> Self {
        self.pad_count = pad_count;
        self
    }

    pub fn set_solicited_event(mut self, solicited: bool) -> Self {
        self.solicited_event = solicited;
        self
    }

    pub fn set_ack_request(mut self, ack_request: bool) -> Self {
        self.ack_request = ack_request;
        self
    }

    pub fn set_remote_address(mut self, address: u64) -> Self {
        self.reth.get_or_insert(RethFields { virtual_address: 0, rkey: 0, dma_length: 0 })
            .virtual_address = address;
        self
    }

    pub fn set_rkey(mut self, rkey: u32) -> Self {
        self.reth.get_or_insert(RethFields { virtual_address: 0, rkey: 0, dma_length: 0 }).rkey =
            rkey;
        self
    }

    pub fn set_dma_length(mut self, length: u32) -> Self {
        self.reth.get_or_insert(RethFields { virtual_address: 0, rkey: 0, dma_length: 0 }).dma_length =
            length;
        self
    }

    pub fn set_syndrome(mut self, syndrome: AethSyndrome) -> Self {
        self.aeth.get_or_insert(AethFields { syndrome: AethSyndrome::Ack, msn: 0 }).syndrome =
            syndrome;
        self
    }

    pub fn set_msn(mut self, msn: u32) -> Self {
        self.aeth.get_or_insert(AethFields { syndrome: AethSyndrome::Ack, msn: 0 }).msn = msn;
        self
    }

    pub fn set_immediate(mut self, immediate: u32) -> Self {
        self.immediate = Some(immediate);
        self
    }

    pub fn set_payload(mut self, payload: &[u8]) -> Self {
        self.payload = payload.to_vec();
        self
    }

    pub fn build(self) -> Vec<u8> {
        let opcode = self.opcode.expect("opcode must be set before build");
        let mut out = Vec::with_capacity(BTH_LEN + self.payload.len() + 16);

        out.push(opcode.to_wire());
        let flags = ((self.solicited_event as u8) << 7)
            | ((self.pad_count & 0b11) << 4);
        out.push(flags);
        out.extend_from_slice(&0u16.to_be_bytes()); // partition key, unused
        out.push(0); // reserved
        out.extend_from_slice(&self.dest_qp.to_be_bytes()[1..4]);
        let psn_and_ack = ((self.ack_request as u32) << 31) | (self.psn & 0x00FF_FFFF);
        out.extend_from_slice(&psn_and_ack.to_be_bytes());
        debug_assert_eq!(out.len(), BTH_LEN);

        if let Some(reth) = self.reth {
            out.extend_from_slice(&reth.virtual_address.to_be_bytes());
            out.extend_from_slice(&reth.rkey.to_be_bytes());
            out.extend_from_slice(&reth.dma_length.to_be_bytes());
        }

        if let Some(aeth) = self.aeth {
            let msn_and_syndrome = ((aeth.syndrome.to_wire() as u32) << 24) | (aeth.msn & 0x00FF_FFFF);
            out.extend_from_slice(&msn_and_syndrome.to_be_bytes());
        }

        if let Some(immediate) = self.immediate {
            out.extend_from_slice(&immediate.to_be_bytes());
        }

        out.extend_from_slice(&self.payload);
        out.extend(std::iter::repeat(0u8).take(self.pad_count as usize));
        out
    }
}

pub struct RdmaPacketParser<'a> {
    bth: BthFields,
    reth: Option<RethFields>,
    aeth: Option<AethFields>,
    immediate: Option<u32>,
    payload: &'a [u8],
}

impl<'a> RdmaPacketParser<'a> {
    pub fn parse(bytes: &'a [u8]) -> Option<Self> {
        if bytes.len() < BTH_LEN {
            return None;
        }
        let opcode = RdmaOpcode::from_wire(bytes[0])?;
        let flags = bytes[1];
        let solicited_event = flags & 0x80 != 0;
        let pad_count = (flags >> 4) & 0b11;
        let dest_qp = u32::from_be_bytes([0, bytes[4], bytes[5], bytes[6]]);
        let psn_and_ack = u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        let ack_request = psn_and_ack & 0x8000_0000 != 0;
        let psn = psn_and_ack & 0x00FF_FFFF;

        let bth = BthFields { opcode, solicited_event, pad_count, dest_qp, ack_request, psn };

        let mut offset = BTH_LEN;
        let mut reth = None;
        if opcode.carries_reth() {
            if bytes.len() < offset + RETH_LEN {
                return None;
            }
            let virtual_address = u64::from_be_bytes(bytes[offset..offset + 8].try_into().ok()?);
            let rkey = u32::from_be_bytes(bytes[offset + 8..offset + 12].try_into().ok()?);
            let dma_length = u32::from_be_bytes(bytes[offset + 12..offset + 16].try_into().ok()?);
            reth = Some(RethFields { virtual_address, rkey, dma_length });
            offset += RETH_LEN;
        }

        let mut aeth = None;
        if opcode.carries_aeth() {
            if bytes.len() < offset + AETH_LEN {
                return None;
            }
            let raw = u32::from_be_bytes(bytes[offset..offset + 4].try_into().ok()?);
            let syndrome = AethSyndrome::from_wire((raw >> 24) as u8);
            let msn = raw & 0x00FF_FFFF;
            aeth = Some(AethFields { syndrome, msn });
            offset += AETH_LEN;
        }

        let mut immediate = None;
        if opcode.has_immediate_variant() {
            if bytes.len() < offset + IMMEDIATE_LEN {
                return None;
            }
            immediate = Some(u32::from_be_bytes(bytes[offset..offset + 4].try_into().ok()?));
            offset += IMMEDIATE_LEN;
        }

        let pad = pad_count as usize;
        if bytes.len() < offset + pad {
            return None;
        }
        let payload = &bytes[offset..bytes.len() - pad];

        Some(Self { bth, reth, aeth, immediate, payload })
    }

    pub fn bth(&self) -> &BthFields {
        &self.bth
    }

    pub fn has_reth(&self) -> bool {
        self.reth.is_some()
    }

    pub fn reth(&self) -> &RethFields {
        self.reth.as_ref().expect("caller must check has_reth")
    }

    pub fn has_aeth(&self) -> bool {
        self.aeth.is_some()
    }

    pub fn aeth(&self) -> &AethFields {
        self.aeth.as_ref().expect("caller must check has_aeth")
    }

    pub fn has_immediate(&self) -> bool {
        self.immediate.is_some()
    }

    pub fn immediate(&self) -> u32 {
        self.immediate.expect("caller must check has_immediate")
    }

    pub fn payload(&self) -> &[u8] {
        self.payload
    }
}
