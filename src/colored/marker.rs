use bitcoin::{
    Script, ScriptBuf, VarInt,
    consensus::{Decodable, Encodable},
    script::{Instruction, PushBytesBuf},
};
use maestro_ledger_macros::{Decode, Encode};

/// `OA` followed by the protocol version
const MARKER_TAG: [u8; 4] = [0x4f, 0x41, 0x01, 0x00];

/// Payload of an Open Assets marker output
#[derive(Encode, Decode, Clone, Debug, Default, PartialEq, Eq)]
pub struct ColorMarker {
    /// Asset quantity for each output, skipping the marker output itself
    pub quantities: Vec<u64>,
    pub metadata: Vec<u8>,
}

impl ColorMarker {
    /// Parse the marker from an output script, `None` if the script is not a valid marker
    pub fn from_script(script: &Script) -> Option<Self> {
        if !script.is_op_return() {
            return None;
        }

        let mut instructions = script.instructions().skip(1);

        let payload = match instructions.next()? {
            Ok(Instruction::PushBytes(bytes)) => bytes.as_bytes(),
            _ => return None,
        };

        if instructions.next().is_some() {
            return None;
        }

        Self::from_payload(payload)
    }

    fn from_payload(payload: &[u8]) -> Option<Self> {
        let mut cursor = payload.strip_prefix(&MARKER_TAG)?;

        let count = VarInt::consensus_decode(&mut cursor).ok()?.0;

        // each quantity takes at least a byte
        if count > cursor.len() as u64 {
            return None;
        }

        let quantities = (0..count)
            .map(|_| read_leb128(&mut cursor))
            .collect::<Option<Vec<_>>>()?;

        let metadata_len = VarInt::consensus_decode(&mut cursor).ok()?.0;

        if metadata_len != cursor.len() as u64 {
            return None;
        }

        Some(Self {
            quantities,
            metadata: cursor.to_vec(),
        })
    }

    pub fn to_payload(&self) -> Vec<u8> {
        let mut out = MARKER_TAG.to_vec();

        // writing into a vec cannot fail
        let _ = VarInt(self.quantities.len() as u64).consensus_encode(&mut out);

        for quantity in &self.quantities {
            write_leb128(*quantity, &mut out);
        }

        let _ = VarInt(self.metadata.len() as u64).consensus_encode(&mut out);
        out.extend_from_slice(&self.metadata);

        out
    }

    pub fn to_script(&self) -> Option<ScriptBuf> {
        let push = PushBytesBuf::try_from(self.to_payload()).ok()?;

        Some(ScriptBuf::new_op_return(push))
    }
}

fn read_leb128(cursor: &mut &[u8]) -> Option<u64> {
    let mut value: u64 = 0;

    for shift in (0..64).step_by(7) {
        let (byte, rest) = cursor.split_first()?;
        *cursor = rest;

        value |= u64::from(byte & 0x7f).checked_shl(shift)?;

        if byte & 0x80 == 0 {
            return Some(value);
        }
    }

    None
}

fn write_leb128(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;

        if value == 0 {
            out.push(byte);
            return;
        }

        out.push(byte | 0x80);
    }
}
