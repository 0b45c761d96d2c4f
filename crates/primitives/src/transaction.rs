//! Transaction types and serialization.

use divid_consensus::money::{money_range, Amount};
use divid_consensus::Hash256;

use crate::encoding::{encode, Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::sha256d;
use crate::outpoint::OutPoint;

pub const CURRENT_TX_VERSION: i32 = 1;
pub const OP_RETURN: u8 = 0x6a;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

impl TxIn {
    pub fn new(prevout: OutPoint, script_sig: Vec<u8>) -> Self {
        Self {
            prevout,
            script_sig,
            sequence: u32::MAX,
        }
    }
}

impl Encodable for TxIn {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.prevout.consensus_encode(encoder);
        encoder.write_var_bytes(&self.script_sig);
        encoder.write_u32_le(self.sequence);
    }
}

impl Decodable for TxIn {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            prevout: OutPoint::consensus_decode(decoder)?,
            script_sig: decoder.read_var_bytes()?,
            sequence: decoder.read_u32_le()?,
        })
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TxOut {
    pub value: Amount,
    pub script_pubkey: Vec<u8>,
}

impl TxOut {
    pub fn new(value: Amount, script_pubkey: Vec<u8>) -> Self {
        Self {
            value,
            script_pubkey,
        }
    }

    /// The marker output that opens a coinstake.
    pub fn empty() -> Self {
        Self {
            value: 0,
            script_pubkey: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.value == 0 && self.script_pubkey.is_empty()
    }

    pub fn is_unspendable(&self) -> bool {
        self.script_pubkey.first() == Some(&OP_RETURN)
    }
}

impl Encodable for TxOut {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i64_le(self.value);
        encoder.write_var_bytes(&self.script_pubkey);
    }
}

impl Decodable for TxOut {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            value: decoder.read_i64_le()?,
            script_pubkey: decoder.read_var_bytes()?,
        })
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Transaction {
    pub version: i32,
    pub vin: Vec<TxIn>,
    pub vout: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn txid(&self) -> Hash256 {
        sha256d(&encode(self))
    }

    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1 && self.vin[0].prevout.is_null()
    }

    /// First input spends a real output and the first output is empty.
    pub fn is_coinstake(&self) -> bool {
        self.vin.first().is_some_and(|input| !input.prevout.is_null())
            && self.vout.len() >= 2
            && self.vout[0].is_empty()
    }

    /// Sum of output values, or `None` when any value or the running sum leaves the money range.
    pub fn value_out(&self) -> Option<Amount> {
        let mut total: Amount = 0;
        for output in &self.vout {
            if !money_range(output.value) {
                return None;
            }
            total = total.checked_add(output.value)?;
            if !money_range(total) {
                return None;
            }
        }
        Some(total)
    }
}

impl Encodable for Transaction {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_vec(&self.vin);
        encoder.write_vec(&self.vout);
        encoder.write_u32_le(self.lock_time);
    }
}

impl Decodable for Transaction {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            version: decoder.read_i32_le()?,
            vin: decoder.read_vec()?,
            vout: decoder.read_vec()?,
            lock_time: decoder.read_u32_le()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::decode;
    use divid_consensus::money::{COIN, MAX_MONEY};

    fn spend(prev: Hash256, outputs: Vec<TxOut>) -> Transaction {
        Transaction {
            version: CURRENT_TX_VERSION,
            vin: vec![TxIn::new(OutPoint::new(prev, 0), vec![0x51])],
            vout: outputs,
            lock_time: 0,
        }
    }

    #[test]
    fn classifies_coinbase_and_coinstake() {
        let coinbase = Transaction {
            version: 1,
            vin: vec![TxIn::new(OutPoint::null(), vec![0x01, 0x02])],
            vout: vec![TxOut::new(5 * COIN, vec![0x51])],
            lock_time: 0,
        };
        assert!(coinbase.is_coinbase());
        assert!(!coinbase.is_coinstake());

        let stake = spend(
            [3u8; 32],
            vec![TxOut::empty(), TxOut::new(10 * COIN, vec![0x51])],
        );
        assert!(stake.is_coinstake());
        assert!(!stake.is_coinbase());

        let plain = spend([3u8; 32], vec![TxOut::new(COIN, vec![0x51])]);
        assert!(!plain.is_coinstake());
    }

    #[test]
    fn value_out_rejects_out_of_range() {
        let tx = spend(
            [1u8; 32],
            vec![TxOut::new(MAX_MONEY, vec![]), TxOut::new(1, vec![])],
        );
        assert_eq!(tx.value_out(), None);
        let tx = spend([1u8; 32], vec![TxOut::new(2, vec![]), TxOut::new(3, vec![])]);
        assert_eq!(tx.value_out(), Some(5));
    }

    #[test]
    fn encoding_layout_and_txid() {
        let tx = spend([7u8; 32], vec![TxOut::new(0x0102, vec![OP_RETURN])]);
        let bytes = encode(&tx);
        // version + vin count + outpoint + script + sequence + vout count + value + script + locktime
        assert_eq!(bytes.len(), 4 + 1 + 36 + 2 + 4 + 1 + 8 + 2 + 4);
        assert_eq!(&bytes[..4], &1i32.to_le_bytes());
        let back: Transaction = decode(&bytes).expect("decode");
        assert_eq!(back, tx);
        assert_eq!(back.txid(), sha256d(&bytes));
        assert!(tx.vout[0].is_unspendable());
    }
}
