//! Block header and block types.

use divid_consensus::Hash256;

use crate::encoding::{encode, Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::sha256d;
use crate::transaction::Transaction;

pub const CURRENT_BLOCK_VERSION: i32 = 4;
pub const HEADER_SIZE: usize = 80;

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn hash(&self) -> Hash256 {
        sha256d(&encode(self))
    }
}

impl Encodable for BlockHeader {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_hash_le(&self.prev_block);
        encoder.write_hash_le(&self.merkle_root);
        encoder.write_u32_le(self.time);
        encoder.write_u32_le(self.bits);
        encoder.write_u32_le(self.nonce);
    }
}

impl Decodable for BlockHeader {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            version: decoder.read_i32_le()?,
            prev_block: decoder.read_hash_le()?,
            merkle_root: decoder.read_hash_le()?,
            time: decoder.read_u32_le()?,
            bits: decoder.read_u32_le()?,
            nonce: decoder.read_u32_le()?,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
    /// Staker signature; only serialized for proof-of-stake blocks.
    pub block_sig: Vec<u8>,
}

impl Block {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn is_proof_of_stake(&self) -> bool {
        self.transactions.len() > 1 && self.transactions[1].is_coinstake()
    }

    pub fn is_proof_of_work(&self) -> bool {
        !self.is_proof_of_stake()
    }

    pub fn merkle_root(&self) -> Hash256 {
        let hashes: Vec<Hash256> = self.transactions.iter().map(Transaction::txid).collect();
        merkle_root(hashes)
    }
}

impl Encodable for Block {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.header.consensus_encode(encoder);
        encoder.write_vec(&self.transactions);
        if self.is_proof_of_stake() {
            encoder.write_var_bytes(&self.block_sig);
        }
    }
}

impl Decodable for Block {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let header = BlockHeader::consensus_decode(decoder)?;
        let transactions: Vec<Transaction> = decoder.read_vec()?;
        let is_pos = transactions.len() > 1 && transactions[1].is_coinstake();
        let block_sig = if is_pos {
            decoder.read_var_bytes()?
        } else {
            Vec::new()
        };
        Ok(Self {
            header,
            transactions,
            block_sig,
        })
    }
}

/// Bitcoin-style merkle root; odd levels duplicate their last hash.
pub fn merkle_root(mut level: Vec<Hash256>) -> Hash256 {
    if level.is_empty() {
        return [0u8; 32];
    }
    while level.len() > 1 {
        if level.len() % 2 == 1 {
            if let Some(last) = level.last().copied() {
                level.push(last);
            }
        }
        level = level
            .chunks(2)
            .map(|pair| {
                let mut joined = [0u8; 64];
                joined[..32].copy_from_slice(&pair[0]);
                joined[32..].copy_from_slice(&pair[1]);
                sha256d(&joined)
            })
            .collect();
    }
    level[0]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::decode;
    use crate::outpoint::OutPoint;
    use crate::transaction::{TxIn, TxOut};

    fn header() -> BlockHeader {
        BlockHeader {
            version: CURRENT_BLOCK_VERSION,
            prev_block: [1u8; 32],
            merkle_root: [2u8; 32],
            time: 1_538_069_980,
            bits: 0x207f_ffff,
            nonce: 42,
        }
    }

    #[test]
    fn header_is_eighty_bytes() {
        let bytes = encode(&header());
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(&bytes[76..], &42u32.to_le_bytes());
        assert_eq!(header().hash(), sha256d(&bytes));
    }

    #[test]
    fn block_sig_only_on_stake_blocks() {
        let coinbase = Transaction {
            version: 1,
            vin: vec![TxIn::new(OutPoint::null(), vec![0x00])],
            vout: vec![TxOut::empty()],
            lock_time: 0,
        };
        let stake = Transaction {
            version: 1,
            vin: vec![TxIn::new(OutPoint::new([9u8; 32], 1), Vec::new())],
            vout: vec![TxOut::empty(), TxOut::new(1, vec![0x51])],
            lock_time: 0,
        };
        let pow = Block {
            header: header(),
            transactions: vec![coinbase.clone()],
            block_sig: vec![0xaa],
        };
        let decoded: Block = decode(&encode(&pow)).expect("pow block");
        assert!(decoded.block_sig.is_empty());
        assert!(decoded.is_proof_of_work());

        let pos = Block {
            header: header(),
            transactions: vec![coinbase, stake],
            block_sig: vec![0xaa, 0xbb],
        };
        let decoded: Block = decode(&encode(&pos)).expect("pos block");
        assert_eq!(decoded, pos);
        assert!(decoded.is_proof_of_stake());
    }

    #[test]
    fn merkle_root_duplicates_odd_leaf() {
        let a = [1u8; 32];
        let b = [2u8; 32];
        assert_eq!(merkle_root(vec![a]), a);
        assert_eq!(merkle_root(vec![a, b, b]), merkle_root(vec![a, b, b, b]));
        assert_ne!(merkle_root(vec![a, b]), merkle_root(vec![b, a]));
    }
}
