use super::codec::WordOrder;
use super::registers::{BlockRead, Channel, MeterDefinition, ModbusRegisterFormat};
use super::tracker::DEFAULT_ERROR_THRESHOLD;

use ModbusRegisterFormat::{Int32, Uint16, Uint32};
use WordOrder::{HighFirst, LowFirst};

const fn ch(
    name: &'static str,
    block: usize,
    offset: usize,
    format: ModbusRegisterFormat,
    word_order: WordOrder,
    scaler: f64,
    decimals: u32,
) -> Channel {
    Channel { name, block, offset, format, word_order, scaler, decimals }
}

/* Carlo Gavazzi EM530, 32 bit values are stored LSW first */
static EM530_READS: [BlockRead; 4] = [
    BlockRead { address: 0x0000, count: 64 },
    BlockRead { address: 0x0056, count: 2 },
    BlockRead { address: 0x0082, count: 6 },
    BlockRead { address: 0x0092, count: 6 },
];

static EM530_CHANNELS: [Channel; 26] = [
    // L-N voltages (V)
    ch("voltageL1", 0, 0, Uint32, LowFirst, 0.1, 1),
    ch("voltageL2", 0, 2, Uint32, LowFirst, 0.1, 1),
    ch("voltageL3", 0, 4, Uint32, LowFirst, 0.1, 1),
    // L-L voltages (V)
    ch("voltageL12", 0, 6, Uint32, LowFirst, 0.1, 1),
    ch("voltageL23", 0, 8, Uint32, LowFirst, 0.1, 1),
    ch("voltageL31", 0, 10, Uint32, LowFirst, 0.1, 1),
    // currents (A)
    ch("currentL1", 0, 12, Uint32, LowFirst, 0.001, 3),
    ch("currentL2", 0, 14, Uint32, LowFirst, 0.001, 3),
    ch("currentL3", 0, 16, Uint32, LowFirst, 0.001, 3),
    // phase power (kW)
    ch("powerL1", 0, 18, Uint32, LowFirst, 0.0001, 4),
    ch("powerL2", 0, 20, Uint32, LowFirst, 0.0001, 4),
    ch("powerL3", 0, 22, Uint32, LowFirst, 0.0001, 4),
    // system power (kW, kVA, kvar)
    ch("activePower", 0, 40, Uint32, LowFirst, 0.1, 1),
    ch("apparentPower", 0, 42, Uint32, LowFirst, 0.1, 1),
    ch("reactivePower", 0, 44, Uint32, LowFirst, 0.1, 1),
    ch("powerFactor", 0, 49, Uint16, LowFirst, 0.001, 3),
    ch("frequency", 0, 51, Uint16, LowFirst, 0.1, 1),
    // energy (kWh, kvarh, kVAh)
    ch("activeEnergy", 0, 52, Uint32, LowFirst, 0.1, 1),
    ch("reactiveEnergy", 0, 54, Uint32, LowFirst, 0.1, 1),
    ch("apparentEnergy", 1, 0, Uint32, LowFirst, 0.1, 1),
    // THD (%)
    ch("thdCurrentL1", 2, 0, Uint32, LowFirst, 0.01, 2),
    ch("thdCurrentL2", 2, 2, Uint32, LowFirst, 0.01, 2),
    ch("thdCurrentL3", 2, 4, Uint32, LowFirst, 0.01, 2),
    ch("thdVoltageL1", 3, 0, Uint32, LowFirst, 0.01, 2),
    ch("thdVoltageL2", 3, 2, Uint32, LowFirst, 0.01, 2),
    ch("thdVoltageL3", 3, 4, Uint32, LowFirst, 0.01, 2),
];

/* Lovato DMG210, 32 bit values are big endian */
static DMG210_READS: [BlockRead; 3] = [
    BlockRead { address: 2, count: 24 },
    BlockRead { address: 0x32, count: 38 },
    BlockRead { address: 6687, count: 10 },
];

static DMG210_CHANNELS: [Channel; 29] = [
    // instantaneous values
    ch("voltageL1", 0, 0, Uint32, HighFirst, 0.01, 2),
    ch("voltageL2", 0, 2, Uint32, HighFirst, 0.01, 2),
    ch("voltageL3", 0, 4, Uint32, HighFirst, 0.01, 2),
    ch("currentL1", 0, 6, Uint32, HighFirst, 0.0001, 4),
    ch("currentL2", 0, 8, Uint32, HighFirst, 0.0001, 4),
    ch("currentL3", 0, 10, Uint32, HighFirst, 0.0001, 4),
    ch("voltageL12", 0, 12, Uint32, HighFirst, 0.01, 2),
    ch("voltageL23", 0, 14, Uint32, HighFirst, 0.01, 2),
    ch("voltageL31", 0, 16, Uint32, HighFirst, 0.01, 2),
    ch("powerL1", 0, 18, Int32, HighFirst, 0.01, 2),
    ch("powerL2", 0, 20, Int32, HighFirst, 0.01, 2),
    ch("powerL3", 0, 22, Int32, HighFirst, 0.01, 2),
    // frequency and equivalent values
    ch("frequency", 1, 0, Uint32, HighFirst, 0.01, 2),
    ch("voltageEquivalent", 1, 2, Uint32, HighFirst, 0.01, 2),
    ch("voltageLineEquivalent", 1, 4, Uint32, HighFirst, 0.01, 2),
    ch("currentEquivalent", 1, 6, Uint32, HighFirst, 0.0001, 4),
    ch("activePower", 1, 8, Int32, HighFirst, 0.01, 2),
    ch("reactivePower", 1, 10, Int32, HighFirst, 0.01, 2),
    ch("apparentPower", 1, 12, Uint32, HighFirst, 0.01, 2),
    ch("powerFactor", 1, 14, Uint32, HighFirst, 0.0001, 4),
    ch("thdVoltageL1", 1, 26, Uint32, HighFirst, 0.01, 2),
    ch("thdVoltageL2", 1, 28, Uint32, HighFirst, 0.01, 2),
    ch("thdVoltageL3", 1, 30, Uint32, HighFirst, 0.01, 2),
    ch("thdCurrentL1", 1, 32, Uint32, HighFirst, 0.01, 2),
    ch("thdCurrentL2", 1, 34, Uint32, HighFirst, 0.01, 2),
    ch("thdCurrentL3", 1, 36, Uint32, HighFirst, 0.01, 2),
    // energy counters
    ch("activeEnergy", 2, 0, Int32, HighFirst, 0.1, 1),
    ch("reactiveEnergy", 2, 4, Int32, HighFirst, 0.1, 1),
    ch("apparentEnergy", 2, 8, Int32, HighFirst, 0.1, 1),
];

pub fn get_em530_definition() -> MeterDefinition {
    MeterDefinition {
        manufacturer: "Carlo Gavazzi",
        model: "EM530",
        reads: &EM530_READS,
        channels: &EM530_CHANNELS,
        error_threshold: DEFAULT_ERROR_THRESHOLD,
    }
}

pub fn get_dmg210_definition() -> MeterDefinition {
    MeterDefinition {
        manufacturer: "Lovato",
        model: "DMG210",
        reads: &DMG210_READS,
        channels: &DMG210_CHANNELS,
        error_threshold: DEFAULT_ERROR_THRESHOLD,
    }
}

/// All built-in meter models
pub fn definitions() -> Vec<MeterDefinition> {
    vec![get_em530_definition(), get_dmg210_definition()]
}

/// Looks up a model by name, ignoring case
pub fn get_meter_definition(model: &str) -> Option<MeterDefinition> {
    definitions().into_iter().find(|d| d.model.eq_ignore_ascii_case(model))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metering_modbus::connection::RegisterBlock;

    fn blank_blocks(definition: &MeterDefinition) -> Vec<RegisterBlock> {
        definition.reads.iter()
            .map(|r| RegisterBlock { address: r.address, count: r.count, words: vec![0; r.count as usize] })
            .collect()
    }

    fn decoded(definition: &MeterDefinition, blocks: &[RegisterBlock], name: &str) -> f64 {
        definition.decode(blocks).unwrap()
            .into_iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v)
            .unwrap()
    }

    #[test]
    fn test_builtin_definitions_are_valid() {
        for definition in definitions() {
            assert_eq!(definition.validate(), Ok(()), "{} is invalid", definition.model);
        }
    }

    #[test]
    fn test_get_meter_definition() {
        assert_eq!(get_meter_definition("em530").map(|d| d.model), Some("EM530"));
        assert_eq!(get_meter_definition("DMG210").map(|d| d.manufacturer), Some("Lovato"));
        assert!(get_meter_definition("iem3255").is_none());
    }

    #[test]
    fn test_em530_reads() {
        let reads: Vec<(u16, u16)> = get_em530_definition().reads.iter().map(|r| (r.address, r.count)).collect();
        assert_eq!(reads, vec![(0x0000, 64), (0x0056, 2), (0x0082, 6), (0x0092, 6)]);
    }

    #[test]
    fn test_dmg210_reads() {
        let reads: Vec<(u16, u16)> = get_dmg210_definition().reads.iter().map(|r| (r.address, r.count)).collect();
        assert_eq!(reads, vec![(2, 24), (0x32, 38), (6687, 10)]);
    }

    #[test]
    fn test_em530_decoding() {
        let definition = get_em530_definition();
        let mut blocks = blank_blocks(&definition);
        blocks[0].words[0] = 2345;
        blocks[0].words[12] = 0x86A0; // 100000 mA, LSW first
        blocks[0].words[13] = 0x0001;
        blocks[0].words[49] = 987;
        blocks[0].words[51] = 500;
        blocks[1].words[0] = 0x4240; // 1000000 * 0.1 kVAh
        blocks[1].words[1] = 0x000F;
        blocks[3].words[2] = 312;

        let cases = [
            ("voltageL1", 234.5),
            ("voltageL2", 0.0),
            ("currentL1", 100.0),
            ("powerFactor", 0.987),
            ("frequency", 50.0),
            ("apparentEnergy", 100000.0),
            ("thdVoltageL2", 3.12),
        ];
        for (name, expected) in cases {
            assert_eq!(decoded(&definition, &blocks, name), expected, "{}", name);
        }
    }

    #[test]
    fn test_dmg210_decoding() {
        let definition = get_dmg210_definition();
        let mut blocks = blank_blocks(&definition);
        blocks[0].words[0] = 0x0000; // 23012 -> 230.12 V, MSW first
        blocks[0].words[1] = 23012;
        blocks[0].words[18] = 0xFFFF; // -1250 -> -12.5 kW
        blocks[0].words[19] = 0xFB1E;
        blocks[1].words[0] = 0x0000;
        blocks[1].words[1] = 4998;
        blocks[1].words[14] = 0x0000;
        blocks[1].words[15] = 9876;
        blocks[2].words[0] = 0x0001; // 65536 + 10 -> 6554.6 kWh
        blocks[2].words[1] = 10;

        let cases = [
            ("voltageL1", 230.12),
            ("powerL1", -12.5),
            ("frequency", 49.98),
            ("powerFactor", 0.9876),
            ("activeEnergy", 6554.6),
            ("reactiveEnergy", 0.0),
        ];
        for (name, expected) in cases {
            assert_eq!(decoded(&definition, &blocks, name), expected, "{}", name);
        }
    }

    #[test]
    fn test_channel_names_are_shared() {
        /* both models publish the same names for the common quantities */
        let em530: Vec<&str> = get_em530_definition().channels.iter().map(|c| c.name).collect();
        let dmg210: Vec<&str> = get_dmg210_definition().channels.iter().map(|c| c.name).collect();
        for name in ["voltageL1", "currentL3", "activePower", "activeEnergy", "thdCurrentL2", "frequency"] {
            assert!(em530.contains(&name), "{} missing in EM530", name);
            assert!(dmg210.contains(&name), "{} missing in DMG210", name);
        }
    }
}
