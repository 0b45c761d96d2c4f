//! Per-block undo records.

use divid_primitives::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use divid_primitives::transaction::TxOut;

const BLOCK_UNDO_VERSION: u8 = 1;

/// A spent output as it was before the spend.
///
/// `height`, `is_coinbase`, `is_coinstake`, and `version` are only meaningful
/// when the spend emptied its transaction's record; `height == 0` otherwise.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct InputUndo {
    pub output: TxOut,
    pub height: i32,
    pub is_coinbase: bool,
    pub is_coinstake: bool,
    pub version: i32,
}

impl Encodable for InputUndo {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.height);
        if self.height != 0 {
            encoder.write_bool(self.is_coinbase);
            encoder.write_bool(self.is_coinstake);
            encoder.write_i32_le(self.version);
        }
        self.output.consensus_encode(encoder);
    }
}

impl Decodable for InputUndo {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let height = decoder.read_i32_le()?;
        let (is_coinbase, is_coinstake, version) = if height != 0 {
            (decoder.read_bool()?, decoder.read_bool()?, decoder.read_i32_le()?)
        } else {
            (false, false, 0)
        };
        Ok(Self {
            output: TxOut::consensus_decode(decoder)?,
            height,
            is_coinbase,
            is_coinstake,
            version,
        })
    }
}

/// Spent outputs of one non-coinbase transaction, in input order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TxUndo {
    pub prevouts: Vec<InputUndo>,
}

impl Encodable for TxUndo {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_vec(&self.prevouts);
    }
}

impl Decodable for TxUndo {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            prevouts: decoder.read_vec()?,
        })
    }
}

/// One `TxUndo` per transaction after the coinbase.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BlockUndo {
    pub txs: Vec<TxUndo>,
}

impl BlockUndo {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u8(BLOCK_UNDO_VERSION);
        encoder.write_vec(&self.txs);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        if decoder.read_u8()? != BLOCK_UNDO_VERSION {
            return Err(DecodeError::InvalidData("unsupported block undo version"));
        }
        let txs = decoder.read_vec()?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self { txs })
    }
}
