// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/fleetsim

//! Holding register space and per-device block allocation

use std::collections::HashMap;

use parking_lot::{Mutex, RwLock};

use crate::model::SampleValue;
use crate::sinks::SinkError;

/// 16-bit encoding: numbers truncate toward zero and wrap, booleans are 1/0.
/// Strings and dropped values have no register representation.
pub fn encode_register(value: &SampleValue) -> Option<u16> {
    match value {
        SampleValue::Number(n) => Some(((n.trunc() as i64) & 0xFFFF) as u16),
        SampleValue::Bool(b) => Some(u16::from(*b)),
        SampleValue::Text(_) | SampleValue::Null => None,
    }
}

/// Flat holding register space shared with the Modbus listener
#[derive(Debug)]
pub struct RegisterBank {
    registers: RwLock<Vec<u16>>,
}

impl RegisterBank {
    pub fn new(count: usize) -> Self {
        Self {
            registers: RwLock::new(vec![0; count]),
        }
    }

    pub fn len(&self) -> usize {
        self.registers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, address: usize) -> Option<u16> {
        self.registers.read().get(address).copied()
    }

    /// `None` when the range runs past the end of the bank
    pub fn read(&self, start: usize, count: usize) -> Option<Vec<u16>> {
        let registers = self.registers.read();
        registers.get(start..start.checked_add(count)?).map(<[u16]>::to_vec)
    }

    /// Writes all or nothing; returns false when the range is out of bounds
    pub fn write(&self, start: usize, values: &[u16]) -> bool {
        let mut registers = self.registers.write();
        let Some(end) = start.checked_add(values.len()) else {
            return false;
        };
        match registers.get_mut(start..end) {
            Some(slot) => {
                slot.copy_from_slice(values);
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Default)]
struct Allocation {
    offsets: HashMap<String, usize>,
    next: usize,
}

/// Device id -> first register of its block. Blocks are handed out in
/// increasing order and never reused for the life of the map.
#[derive(Debug)]
pub struct RegisterMap {
    base_offset: usize,
    block_size: usize,
    capacity: usize,
    allocation: Mutex<Allocation>,
}

impl RegisterMap {
    pub fn new(base_offset: usize, block_size: usize, capacity: usize) -> Self {
        Self {
            base_offset,
            block_size,
            capacity,
            allocation: Mutex::new(Allocation {
                offsets: HashMap::new(),
                next: base_offset,
            }),
        }
    }

    pub fn layout(&self) -> (usize, usize, usize) {
        (self.base_offset, self.block_size, self.capacity)
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Existing offset for the device, or the next free block
    pub fn allocate(&self, device_id: &str) -> Result<usize, SinkError> {
        let mut allocation = self.allocation.lock();
        if let Some(offset) = allocation.offsets.get(device_id) {
            return Ok(*offset);
        }

        let offset = allocation.next;
        if offset + self.block_size > self.capacity {
            return Err(SinkError::Capacity(format!(
                "no register block left for {} ({} devices mapped)",
                device_id,
                allocation.offsets.len()
            )));
        }
        allocation.offsets.insert(device_id.to_string(), offset);
        allocation.next = offset + self.block_size;
        Ok(offset)
    }

    pub fn offset_of(&self, device_id: &str) -> Option<usize> {
        self.allocation.lock().offsets.get(device_id).copied()
    }

    /// Current mapping ordered by offset
    pub fn allocations(&self) -> Vec<(String, usize)> {
        let mut entries: Vec<(String, usize)> = self
            .allocation
            .lock()
            .offsets
            .iter()
            .map(|(id, offset)| (id.clone(), *offset))
            .collect();
        entries.sort_by_key(|(_, offset)| *offset);
        entries
    }

    pub fn len(&self) -> usize {
        self.allocation.lock().offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_encode_register() {
        assert_eq!(encode_register(&SampleValue::Number(42.9)), Some(42));
        assert_eq!(encode_register(&SampleValue::Number(-1.0)), Some(0xFFFF));
        assert_eq!(encode_register(&SampleValue::Number(65537.0)), Some(1));
        assert_eq!(encode_register(&SampleValue::Bool(true)), Some(1));
        assert_eq!(encode_register(&SampleValue::Text("x".into())), None);
        assert_eq!(encode_register(&SampleValue::Null), None);
    }

    #[test]
    fn test_bank_bounds() {
        let bank = RegisterBank::new(10);
        assert!(bank.write(8, &[1, 2]));
        assert!(!bank.write(9, &[1, 2]));
        assert_eq!(bank.read(8, 2), Some(vec![1, 2]));
        assert_eq!(bank.read(9, 2), None);
        assert_eq!(bank.get(10), None);
    }

    #[test]
    fn test_allocation_is_stable_and_bounded() {
        let map = RegisterMap::new(100, 100, 400);
        assert_eq!(map.allocate("a").unwrap(), 100);
        assert_eq!(map.allocate("b").unwrap(), 200);
        assert_eq!(map.allocate("a").unwrap(), 100);
        assert_eq!(map.allocate("c").unwrap(), 300);
        assert!(matches!(map.allocate("d"), Err(SinkError::Capacity(_))));
        assert_eq!(map.allocations().len(), 3);
    }

    #[test]
    fn test_concurrent_allocation_is_injective() {
        let map = Arc::new(RegisterMap::new(100, 100, 100_000));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let map = map.clone();
                thread::spawn(move || {
                    for i in 0..50 {
                        map.allocate(&format!("dev-{}", i % 40 + t * 10)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let offsets: Vec<usize> = map.allocations().into_iter().map(|(_, o)| o).collect();
        for pair in offsets.windows(2) {
            assert!(pair[1] >= pair[0] + 100);
        }
        assert_eq!(offsets.len(), map.len());
    }
}
