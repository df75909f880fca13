/// In-memory simulated target
///
/// A minimal backend that executes "instructions" by advancing the program
/// counter by a fixed width. Used by the `remora serve` command and by tests.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::target::{DebugTarget, StopToken, TargetError, TargetResult};
use crate::types::*;

/// Instructions executed between yields to other threads while running
const YIELD_INTERVAL: u64 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Region {
    start: u64,
    length: u64,
}

impl Region {
    fn contains(&self, address: u64, length: usize) -> bool {
        let end = address.checked_add(length as u64);
        address >= self.start && end.map_or(false, |end| end <= self.start + self.length)
    }
}

#[derive(Debug, Clone)]
pub struct SimTarget {
    layout: RegisterLayout,
    registers: HashMap<String, u128>,
    memory: BTreeMap<u64, u8>,
    regions: Vec<Region>,
    software_breakpoints: HashSet<u64>,
    hardware_breakpoints: HashSet<u64>,
    instruction_width: u64,
    halt_signal: u8,
    description: Option<String>,
    threads: Vec<ThreadId>,
    offsets: SectionOffsets,
    killed: bool,
}

impl SimTarget {
    pub fn new(layout: RegisterLayout) -> Self {
        let registers = layout.iter().map(|r| (r.name.clone(), 0)).collect();
        Self {
            layout,
            registers,
            memory: BTreeMap::new(),
            regions: Vec::new(),
            software_breakpoints: HashSet::new(),
            hardware_breakpoints: HashSet::new(),
            instruction_width: 4,
            halt_signal: SIGTRAP,
            description: None,
            threads: Vec::new(),
            offsets: SectionOffsets::default(),
            killed: false,
        }
    }

    /// Restrict memory accesses to the given regions. With no regions all
    /// addresses are accessible.
    pub fn with_region(mut self, start: u64, length: u64) -> Self {
        self.regions.push(Region { start, length });
        self
    }

    pub fn with_instruction_width(mut self, width: u64) -> Self {
        self.instruction_width = width.max(1);
        self
    }

    pub fn with_target_description(mut self, xml: impl Into<String>) -> Self {
        self.description = Some(xml.into());
        self
    }

    pub fn with_threads(mut self, threads: Vec<ThreadId>) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_offsets(mut self, offsets: SectionOffsets) -> Self {
        self.offsets = offsets;
        self
    }

    pub fn layout(&self) -> &RegisterLayout {
        &self.layout
    }

    /// Copy `data` into memory at `address`, ignoring region checks
    pub fn load(&mut self, address: u64, data: &[u8]) {
        for (i, &b) in data.iter().enumerate() {
            self.memory.insert(address.wrapping_add(i as u64), b);
        }
    }

    pub fn set_register(&mut self, name: &str, value: u128) {
        self.registers.insert(name.to_string(), value);
    }

    pub fn register(&self, name: &str) -> Option<u128> {
        self.registers.get(name).copied()
    }

    /// Record a halt that happened outside any debugger request
    pub fn set_halt_signal(&mut self, signal: u8) {
        self.halt_signal = signal;
    }

    pub fn is_killed(&self) -> bool {
        self.killed
    }

    pub fn software_breakpoints(&self) -> impl Iterator<Item = &u64> {
        self.software_breakpoints.iter()
    }

    pub fn hardware_breakpoints(&self) -> impl Iterator<Item = &u64> {
        self.hardware_breakpoints.iter()
    }

    fn check_access(&self, address: u64, length: usize) -> TargetResult<()> {
        if self.regions.is_empty() || self.regions.iter().any(|r| r.contains(address, length)) {
            Ok(())
        } else {
            Err(TargetError::MemoryAccess(address))
        }
    }

    fn pc_name(&self) -> TargetResult<String> {
        self.layout
            .program_counter()
            .map(|r| r.name.clone())
            .ok_or_else(|| TargetError::InvalidRegister("pc".to_string()))
    }

    fn pc(&self) -> TargetResult<u64> {
        let name = self.pc_name()?;
        Ok(self.registers.get(&name).copied().unwrap_or(0) as u64)
    }

    fn advance(&mut self) -> TargetResult<u64> {
        let name = self.pc_name()?;
        let pc = self.registers.get(&name).copied().unwrap_or(0) as u64;
        let next = pc.wrapping_add(self.instruction_width);
        self.registers.insert(name, u128::from(next));
        Ok(next)
    }

    fn at_breakpoint(&self, address: u64) -> bool {
        self.software_breakpoints.contains(&address) || self.hardware_breakpoints.contains(&address)
    }
}

impl DebugTarget for SimTarget {
    fn read_memory(&mut self, address: u64, length: usize) -> TargetResult<Vec<u8>> {
        self.check_access(address, length)?;
        Ok((0..length as u64)
            .map(|i| self.memory.get(&address.wrapping_add(i)).copied().unwrap_or(0))
            .collect())
    }

    fn write_memory(&mut self, address: u64, data: &[u8]) -> TargetResult<()> {
        self.check_access(address, data.len())?;
        self.load(address, data);
        Ok(())
    }

    fn read_register(&mut self, register: &RegisterDescriptor) -> TargetResult<u128> {
        self.registers
            .get(&register.name)
            .copied()
            .ok_or_else(|| TargetError::InvalidRegister(register.name.clone()))
    }

    fn write_register(&mut self, register: &RegisterDescriptor, value: u128) -> TargetResult<()> {
        if !self.registers.contains_key(&register.name) {
            return Err(TargetError::InvalidRegister(register.name.clone()));
        }
        self.registers.insert(register.name.clone(), value);
        Ok(())
    }

    fn step_instruction(&mut self) -> TargetResult<u8> {
        self.advance()?;
        self.halt_signal = SIGTRAP;
        Ok(SIGTRAP)
    }

    fn resume_execution(&mut self, stop: &StopToken) -> TargetResult<u8> {
        // Step off a breakpoint at the starting address first.
        let start = self.pc()?;
        let mut executed = 0u64;
        let mut pc = if self.at_breakpoint(start) { self.advance()? } else { start };

        loop {
            if stop.is_stop_requested() {
                self.halt_signal = SIGINT;
                return Ok(SIGINT);
            }
            if self.at_breakpoint(pc) {
                log::debug!("Simulator hit breakpoint at {:#x}", pc);
                self.halt_signal = SIGTRAP;
                return Ok(SIGTRAP);
            }

            pc = self.advance()?;
            executed += 1;
            if executed % YIELD_INTERVAL == 0 {
                std::thread::yield_now();
            }
        }
    }

    fn set_software_breakpoint(&mut self, address: u64) -> TargetResult<()> {
        self.software_breakpoints.insert(address);
        Ok(())
    }

    fn clear_software_breakpoint(&mut self, address: u64) -> TargetResult<()> {
        self.software_breakpoints.remove(&address);
        Ok(())
    }

    fn set_hardware_breakpoint(&mut self, address: u64) -> TargetResult<()> {
        self.hardware_breakpoints.insert(address);
        Ok(())
    }

    fn clear_hardware_breakpoint(&mut self, address: u64) -> TargetResult<()> {
        self.hardware_breakpoints.remove(&address);
        Ok(())
    }

    fn current_halt_signal(&mut self) -> u8 {
        self.halt_signal
    }

    fn kill(&mut self) -> TargetResult<()> {
        self.killed = true;
        Ok(())
    }

    fn threads(&mut self) -> Vec<ThreadId> {
        self.threads.clone()
    }

    fn section_offsets(&mut self) -> SectionOffsets {
        self.offsets
    }

    fn target_description(&self) -> Option<String> {
        self.description.clone()
    }

    fn memory_map(&self) -> Option<String> {
        if self.regions.is_empty() {
            return None;
        }

        let mut xml = String::from(
            "<?xml version=\"1.0\"?>\n<!DOCTYPE memory-map PUBLIC \"+//IDN gnu.org//DTD GDB Memory Map V1.0//EN\" \"http://sourceware.org/gdb/gdb-memory-map.dtd\">\n<memory-map>\n",
        );
        for region in &self.regions {
            xml.push_str(&format!(
                "  <memory type=\"ram\" start=\"{:#x}\" length=\"{:#x}\"/>\n",
                region.start, region.length
            ));
        }
        xml.push_str("</memory-map>\n");
        Some(xml)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> SimTarget {
        SimTarget::new(RegisterLayout::riscv32())
    }

    #[test]
    fn test_memory_regions_are_enforced() {
        let mut sim = target().with_region(0x1000, 0x100);

        assert!(sim.write_memory(0x1000, &[1, 2, 3, 4]).is_ok());
        assert_eq!(sim.read_memory(0x1000, 4).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(sim.read_memory(0x10fe, 4), Err(TargetError::MemoryAccess(0x10fe)));
        assert_eq!(sim.read_memory(0x2000, 1), Err(TargetError::MemoryAccess(0x2000)));
    }

    #[test]
    fn test_resume_stops_at_breakpoint() {
        let mut sim = target();
        sim.set_register("pc", 0x4000);
        sim.set_software_breakpoint(0x4010).unwrap();

        let signal = sim.resume_execution(&StopToken::new()).unwrap();

        assert_eq!(signal, SIGTRAP);
        assert_eq!(sim.register("pc"), Some(0x4010));
    }

    #[test]
    fn test_resume_steps_off_current_breakpoint() {
        let mut sim = target();
        sim.set_register("pc", 0x4000);
        sim.set_hardware_breakpoint(0x4000).unwrap();
        sim.set_hardware_breakpoint(0x4008).unwrap();

        sim.resume_execution(&StopToken::new()).unwrap();
        assert_eq!(sim.register("pc"), Some(0x4008));
    }

    #[test]
    fn test_resume_honors_stop_token() {
        let mut sim = target();
        let token = StopToken::new();
        token.request_stop();

        assert_eq!(sim.resume_execution(&token).unwrap(), SIGINT);
        assert_eq!(sim.current_halt_signal(), SIGINT);
    }

    #[test]
    fn test_step_advances_program_counter() {
        let mut sim = target().with_instruction_width(2);
        sim.set_register("pc", 0x100);

        assert_eq!(sim.step_instruction().unwrap(), SIGTRAP);
        assert_eq!(sim.register("pc"), Some(0x102));
    }

    #[test]
    fn test_memory_map_lists_regions() {
        let sim = target().with_region(0x2000_0000, 0x1_0000);
        let xml = sim.memory_map().unwrap();

        assert!(xml.contains("start=\"0x20000000\" length=\"0x10000\""));
        assert!(target().memory_map().is_none());
    }
}
