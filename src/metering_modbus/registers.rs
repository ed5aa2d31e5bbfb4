use std::collections::HashSet;
use thiserror::Error;

use super::codec::{combine_i32, combine_u32, scale, WordOrder};
use super::connection::{RegisterBlock, MAX_READ_COUNT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModbusRegisterFormat {
    Uint16,
    Int16,
    Uint32,
    Int32,
}

impl ModbusRegisterFormat {
    /// Number of 16 bit registers a value occupies
    pub fn width(&self) -> usize {
        match self {
            ModbusRegisterFormat::Uint16 | ModbusRegisterFormat::Int16 => 1,
            ModbusRegisterFormat::Uint32 | ModbusRegisterFormat::Int32 => 2,
        }
    }

    pub fn signed(&self) -> bool {
        matches!(self, ModbusRegisterFormat::Int16 | ModbusRegisterFormat::Int32)
    }
}

/// One holding register read of a sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRead {
    pub address: u16,
    pub count: u16,
}

/// Where a named value lives inside the blocks of a sample and how to scale it
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Channel {
    pub name: &'static str,
    pub block: usize,
    pub offset: usize,
    pub format: ModbusRegisterFormat,
    pub word_order: WordOrder,
    pub scaler: f64,
    pub decimals: u32,
}

impl Channel {
    /// Decodes the channel out of `words`, which must hold `offset + width` entries
    pub fn decode(&self, words: &[u16]) -> f64 {
        let words = &words[self.offset..self.offset + self.format.width()];
        let raw = match self.format {
            ModbusRegisterFormat::Uint16 => f64::from(words[0]),
            ModbusRegisterFormat::Int16 => f64::from(words[0] as i16),
            ModbusRegisterFormat::Uint32 => {
                let (high, low) = self.word_order.split(words);
                f64::from(combine_u32(high, low))
            }
            ModbusRegisterFormat::Int32 => {
                let (high, low) = self.word_order.split(words);
                f64::from(combine_i32(high, low))
            }
        };
        scale(raw, self.scaler, self.decimals)
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum DefinitionError {
    #[error("Definition has no reads")]
    NoReads,
    #[error("Read {index} asks for {count} registers")]
    InvalidReadCount { index: usize, count: u16 },
    #[error("Channel {0} refers to a block that is never read")]
    UnknownBlock(&'static str),
    #[error("Channel {name} needs {needed} registers of block {block}, which has {available}")]
    OutOfBlock { name: &'static str, block: usize, needed: usize, available: usize },
    #[error("Channel {0} is defined twice")]
    DuplicateChannel(&'static str),
    #[error("Expected {expected} blocks, got {received}")]
    BlockCount { expected: usize, received: usize },
    #[error("Block {index} holds {received} registers instead of {expected}")]
    ShortBlock { index: usize, expected: usize, received: usize },
}

/// Static description of one meter model: what to read and how to decode it
#[derive(Debug, Clone, PartialEq)]
pub struct MeterDefinition {
    pub manufacturer: &'static str,
    pub model: &'static str,
    pub reads: &'static [BlockRead],
    pub channels: &'static [Channel],
    pub error_threshold: u32,
}

impl MeterDefinition {
    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.reads.is_empty() {
            return Err(DefinitionError::NoReads);
        }

        for (index, read) in self.reads.iter().enumerate() {
            if read.count == 0 || read.count > MAX_READ_COUNT {
                return Err(DefinitionError::InvalidReadCount { index, count: read.count });
            }
        }

        let mut names = HashSet::new();
        for channel in self.channels {
            if !names.insert(channel.name) {
                return Err(DefinitionError::DuplicateChannel(channel.name));
            }

            let read = self.reads.get(channel.block)
                .ok_or(DefinitionError::UnknownBlock(channel.name))?;
            let needed = channel.offset + channel.format.width();
            if needed > read.count as usize {
                return Err(DefinitionError::OutOfBlock {
                    name: channel.name,
                    block: channel.block,
                    needed,
                    available: read.count as usize,
                });
            }
        }

        Ok(())
    }

    /// Decodes every channel. Blocks must be complete and in read order.
    pub fn decode(&self, blocks: &[RegisterBlock]) -> Result<Vec<(&'static str, f64)>, DefinitionError> {
        self.validate()?;

        if blocks.len() != self.reads.len() {
            return Err(DefinitionError::BlockCount { expected: self.reads.len(), received: blocks.len() });
        }

        for (index, (block, read)) in blocks.iter().zip(self.reads.iter()).enumerate() {
            if block.words.len() != read.count as usize {
                return Err(DefinitionError::ShortBlock {
                    index,
                    expected: read.count as usize,
                    received: block.words.len(),
                });
            }
        }

        let mut values = Vec::with_capacity(self.channels.len());
        for channel in self.channels {
            /* checked by validate() above */
            let value = channel.decode(&blocks[channel.block].words);
            values.push((channel.name, value));
        }
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const fn ch(name: &'static str, block: usize, offset: usize, format: ModbusRegisterFormat) -> Channel {
        Channel { name, block, offset, format, word_order: WordOrder::HighFirst, scaler: 1.0, decimals: 0 }
    }

    fn definition(reads: &'static [BlockRead], channels: &'static [Channel]) -> MeterDefinition {
        MeterDefinition { manufacturer: "Test", model: "T1", reads, channels, error_threshold: 2 }
    }

    fn block(address: u16, words: &[u16]) -> RegisterBlock {
        RegisterBlock { address, count: words.len() as u16, words: words.to_vec() }
    }

    #[test]
    fn test_format_width() {
        assert_eq!(ModbusRegisterFormat::Uint16.width(), 1);
        assert_eq!(ModbusRegisterFormat::Int32.width(), 2);
        assert!(ModbusRegisterFormat::Int16.signed());
        assert!(!ModbusRegisterFormat::Uint32.signed());
    }

    #[test]
    fn test_channel_decode() {
        let words = [0xFFFF, 0xFF9C, 0x0001, 0x0000];
        assert_eq!(ch("a", 0, 0, ModbusRegisterFormat::Int32).decode(&words), -100.0);
        assert_eq!(ch("b", 0, 1, ModbusRegisterFormat::Int16).decode(&words), -100.0);
        assert_eq!(ch("c", 0, 1, ModbusRegisterFormat::Uint16).decode(&words), 65436.0);
        assert_eq!(ch("d", 0, 2, ModbusRegisterFormat::Uint32).decode(&words), 65536.0);

        let low_first = Channel { word_order: WordOrder::LowFirst, ..ch("e", 0, 2, ModbusRegisterFormat::Uint32) };
        assert_eq!(low_first.decode(&words), 1.0);
    }

    #[test]
    fn test_validate_rejects_bad_tables() {
        static READS: [BlockRead; 1] = [BlockRead { address: 0, count: 2 }];
        static OUT_OF_BLOCK: [Channel; 1] = [ch("x", 0, 1, ModbusRegisterFormat::Uint32)];
        static UNKNOWN_BLOCK: [Channel; 1] = [ch("x", 1, 0, ModbusRegisterFormat::Uint16)];
        static DUPLICATE: [Channel; 2] = [ch("x", 0, 0, ModbusRegisterFormat::Uint16), ch("x", 0, 1, ModbusRegisterFormat::Uint16)];
        static TOO_LARGE: [BlockRead; 1] = [BlockRead { address: 0, count: 200 }];

        assert!(matches!(definition(&READS, &OUT_OF_BLOCK).validate(), Err(DefinitionError::OutOfBlock { needed: 3, .. })));
        assert_eq!(definition(&READS, &UNKNOWN_BLOCK).validate(), Err(DefinitionError::UnknownBlock("x")));
        assert_eq!(definition(&READS, &DUPLICATE).validate(), Err(DefinitionError::DuplicateChannel("x")));
        assert_eq!(definition(&[], &[]).validate(), Err(DefinitionError::NoReads));
        assert!(matches!(definition(&TOO_LARGE, &[]).validate(), Err(DefinitionError::InvalidReadCount { index: 0, count: 200 })));
    }

    #[test]
    fn test_decode_checks_blocks() {
        static READS: [BlockRead; 2] = [BlockRead { address: 0, count: 2 }, BlockRead { address: 10, count: 1 }];
        static CHANNELS: [Channel; 2] = [ch("a", 0, 0, ModbusRegisterFormat::Uint32), ch("b", 1, 0, ModbusRegisterFormat::Uint16)];
        let def = definition(&READS, &CHANNELS);
        assert_eq!(def.validate(), Ok(()));

        let values = def.decode(&[block(0, &[1, 2]), block(10, &[7])]).unwrap();
        assert_eq!(values, vec![("a", 65538.0), ("b", 7.0)]);

        assert_eq!(
            def.decode(&[block(0, &[1, 2])]),
            Err(DefinitionError::BlockCount { expected: 2, received: 1 })
        );
        assert_eq!(
            def.decode(&[block(0, &[1]), block(10, &[7])]),
            Err(DefinitionError::ShortBlock { index: 0, expected: 2, received: 1 })
        );
    }

    #[test]
    fn test_decode_rejects_unchecked_table() {
        static READS: [BlockRead; 1] = [BlockRead { address: 0, count: 2 }];
        static OUT_OF_BLOCK: [Channel; 1] = [ch("x", 0, 1, ModbusRegisterFormat::Uint32)];
        static UNKNOWN_BLOCK: [Channel; 1] = [ch("y", 3, 0, ModbusRegisterFormat::Uint16)];

        let blocks = [block(0, &[1, 2])];
        assert!(matches!(definition(&READS, &OUT_OF_BLOCK).decode(&blocks), Err(DefinitionError::OutOfBlock { .. })));
        assert_eq!(definition(&READS, &UNKNOWN_BLOCK).decode(&blocks), Err(DefinitionError::UnknownBlock("y")));
    }
}
