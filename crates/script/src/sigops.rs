//! Signature-operation counting.

use divid_primitives::transaction::Transaction;

use crate::opcodes::{
    decode_small_int, Instructions, OP_1, OP_16, OP_CHECKMULTISIG, OP_CHECKMULTISIGVERIFY,
    OP_CHECKSIG, OP_CHECKSIGVERIFY,
};
use crate::standard::is_p2sh;

const MAX_PUBKEYS_PER_MULTISIG: u32 = 20;

/// Counts CHECKSIG-family operations. In `accurate` mode a multisig preceded
/// by `OP_n` counts `n` instead of the worst case.
pub fn script_sigop_count(script: &[u8], accurate: bool) -> u32 {
    let mut count = 0u32;
    let mut last_opcode = None;
    for instruction in Instructions::new(script) {
        let Ok(instruction) = instruction else {
            break;
        };
        match instruction.opcode {
            OP_CHECKSIG | OP_CHECKSIGVERIFY => count += 1,
            OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                count += match last_opcode {
                    Some(op @ OP_1..=OP_16) if accurate => {
                        decode_small_int(op).unwrap_or(MAX_PUBKEYS_PER_MULTISIG)
                    }
                    _ => MAX_PUBKEYS_PER_MULTISIG,
                };
            }
            _ => {}
        }
        last_opcode = Some(instruction.opcode);
    }
    count
}

/// Sigops in the redeem script carried by `script_sig` when spending a P2SH output.
pub fn p2sh_sigop_count(script_pubkey: &[u8], script_sig: &[u8]) -> u32 {
    if !is_p2sh(script_pubkey) {
        return 0;
    }
    let mut redeem_script: &[u8] = &[];
    for instruction in Instructions::new(script_sig) {
        match instruction {
            Ok(instruction) => match instruction.push {
                Some(payload) => redeem_script = payload,
                None if instruction.opcode <= OP_16 => redeem_script = &[],
                None => return 0,
            },
            Err(_) => return 0,
        }
    }
    script_sigop_count(redeem_script, true)
}

/// Inaccurate count over every input and output script.
pub fn legacy_sigop_count(tx: &Transaction) -> u32 {
    let inputs: u32 = tx
        .vin
        .iter()
        .map(|input| script_sigop_count(&input.script_sig, false))
        .sum();
    let outputs: u32 = tx
        .vout
        .iter()
        .map(|output| script_sigop_count(&output.script_pubkey, false))
        .sum();
    inputs + outputs
}

/// P2SH sigops of a non-coinbase transaction. `prev_script` resolves each input's spent script.
pub fn tx_p2sh_sigop_count<'a, F>(tx: &Transaction, mut prev_script: F) -> u32
where
    F: FnMut(usize) -> Option<&'a [u8]>,
{
    if tx.is_coinbase() {
        return 0;
    }
    tx.vin
        .iter()
        .enumerate()
        .filter_map(|(index, input)| {
            prev_script(index).map(|script| p2sh_sigop_count(script, &input.script_sig))
        })
        .sum()
}
