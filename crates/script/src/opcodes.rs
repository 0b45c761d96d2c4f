pub const OP_0: u8 = 0x00;
pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHDATA2: u8 = 0x4d;
pub const OP_PUSHDATA4: u8 = 0x4e;
pub const OP_1: u8 = 0x51;
pub const OP_16: u8 = 0x60;
pub const OP_RETURN: u8 = 0x6a;
pub const OP_DUP: u8 = 0x76;
pub const OP_EQUAL: u8 = 0x87;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_CHECKSIG: u8 = 0xac;
pub const OP_CHECKSIGVERIFY: u8 = 0xad;
pub const OP_CHECKMULTISIG: u8 = 0xae;
pub const OP_CHECKMULTISIGVERIFY: u8 = 0xaf;

/// One parsed script element: an opcode and, for pushes, its payload.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Instruction<'a> {
    pub opcode: u8,
    pub push: Option<&'a [u8]>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TruncatedPush;

/// Iterates script elements; stops (yielding `Err`) at a truncated push.
pub struct Instructions<'a> {
    script: &'a [u8],
    cursor: usize,
    failed: bool,
}

impl<'a> Instructions<'a> {
    pub fn new(script: &'a [u8]) -> Self {
        Self {
            script,
            cursor: 0,
            failed: false,
        }
    }

    fn read_len(&mut self, width: usize) -> Option<usize> {
        let bytes = self.script.get(self.cursor..self.cursor + width)?;
        self.cursor += width;
        let mut value = [0u8; 4];
        value[..width].copy_from_slice(bytes);
        usize::try_from(u32::from_le_bytes(value)).ok()
    }
}

impl<'a> Iterator for Instructions<'a> {
    type Item = Result<Instruction<'a>, TruncatedPush>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.cursor >= self.script.len() {
            return None;
        }
        let opcode = self.script[self.cursor];
        self.cursor += 1;
        if opcode > OP_PUSHDATA4 {
            return Some(Ok(Instruction { opcode, push: None }));
        }

        let len = match opcode {
            OP_PUSHDATA1 => self.read_len(1),
            OP_PUSHDATA2 => self.read_len(2),
            OP_PUSHDATA4 => self.read_len(4),
            direct => Some(direct as usize),
        };
        let payload = len.and_then(|len| {
            let end = self.cursor.checked_add(len)?;
            let payload = self.script.get(self.cursor..end)?;
            self.cursor = end;
            Some(payload)
        });
        match payload {
            Some(payload) => Some(Ok(Instruction {
                opcode,
                push: Some(payload),
            })),
            None => {
                self.failed = true;
                Some(Err(TruncatedPush))
            }
        }
    }
}

pub fn decode_small_int(opcode: u8) -> Option<u32> {
    match opcode {
        OP_0 => Some(0),
        OP_1..=OP_16 => Some(u32::from(opcode - OP_1 + 1)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_push_forms() {
        let script = [0x02, 0xaa, 0xbb, OP_PUSHDATA1, 0x01, 0xcc, OP_CHECKSIG];
        let ops: Vec<_> = Instructions::new(&script).collect();
        assert_eq!(ops.len(), 3);
        assert_eq!(ops[0], Ok(Instruction { opcode: 0x02, push: Some(&[0xaa, 0xbb][..]) }));
        assert_eq!(ops[1], Ok(Instruction { opcode: OP_PUSHDATA1, push: Some(&[0xcc][..]) }));
        assert_eq!(ops[2], Ok(Instruction { opcode: OP_CHECKSIG, push: None }));
    }

    #[test]
    fn truncated_push_ends_iteration() {
        let script = [OP_CHECKSIG, OP_PUSHDATA2, 0x05, 0x00, 0x01];
        let ops: Vec<_> = Instructions::new(&script).collect();
        assert_eq!(ops.len(), 2);
        assert!(ops[1].is_err());
        assert_eq!(decode_small_int(OP_16), Some(16));
        assert_eq!(decode_small_int(OP_CHECKSIG), None);
    }
}
