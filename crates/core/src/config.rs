//! Configuration system for the simulator.
//!
//! This module defines all configuration structures and enums used to
//! parameterize a run. It provides:
//! 1. **Defaults:** Baseline machine constants (pipeline widths, cache
//!    geometry, network timing).
//! 2. **Structures:** Hierarchical config for system, processor, cache,
//!    memory, and network parameters.
//! 3. **Enums:** Consistency model, L1 write policy, and event-list kind.
//!
//! Configuration is supplied as JSON (see the CLI's `--config`) or via
//! `Config::default()`. `Config::validate` rejects the combinations the
//! machine model does not define.

use serde::Deserialize;

use crate::common::SimError;

/// Default configuration constants for the simulator.
mod defaults {
    /// Number of processor nodes.
    pub const NUM_PROCS: usize = 1;

    /// Instructions fetched per cycle.
    pub const FETCH_RATE: usize = 4;

    /// Instructions retired per cycle.
    pub const RETIRE_RATE: usize = 4;

    /// Instructions issued to functional units per cycle.
    pub const ISSUE_RATE: usize = 4;

    /// Active-list (reorder buffer) entries.
    pub const ACTIVE_LIST_SIZE: usize = 64;

    /// Physical integer registers. The windowed logical space is large
    /// (8 + 16 × windows + state regs), so the file must clear it with
    /// rename slack to spare.
    pub const NUM_PHYS_INT: usize = 224;

    /// Physical floating-point registers.
    pub const NUM_PHYS_FP: usize = 128;

    /// SPARC register windows.
    pub const NUM_WINDOWS: usize = 8;

    /// Two-bit-counter pattern history table entries.
    pub const BRANCH_PRED_SIZE: usize = 512;

    /// Return address stack entries.
    pub const RAS_SIZE: usize = 8;

    /// L1 cache size in bytes (16 KiB).
    pub const L1_SIZE: usize = 16 * 1024;

    /// L1 associativity (direct-mapped).
    pub const L1_ASSOC: usize = 1;

    /// Cache line size as a power of two (64-byte lines).
    pub const LINE_BITS: u32 = 6;

    /// L1 access latency in processor cycles.
    pub const L1_LATENCY: u64 = 1;

    /// L1 miss-status holding registers.
    pub const MSHRS_L1: usize = 8;

    /// L2 cache size in bytes (64 KiB).
    pub const L2_SIZE: usize = 64 * 1024;

    /// L2 associativity.
    pub const L2_ASSOC: usize = 4;

    /// L2 access latency in processor cycles.
    pub const L2_LATENCY: u64 = 5;

    /// L2 miss-status holding registers.
    pub const MSHRS_L2: usize = 8;

    /// Write buffer entries (coalesced lines).
    pub const WRITE_BUFFER_SIZE: usize = 8;

    /// Node bus width in bytes.
    pub const BUS_WIDTH: u64 = 32;

    /// Node bus arbitration + transfer base latency in cycles.
    pub const BUS_LATENCY: u64 = 3;

    /// Main memory access latency in cycles.
    pub const MEM_LATENCY: u64 = 18;

    /// Directory SRAM entries per home node.
    pub const DIRECTORY_ENTRIES: usize = 4096;

    /// Network cycle time in processor cycles; all network delays are
    /// multiples of this.
    pub const NETWORK_CYCLE_TIME: f64 = 1.0;

    /// Cycles for one flit to traverse a link.
    pub const FLIT_DELAY: u64 = 1;

    /// Cycles to move a flit through a multiplexer.
    pub const MUX_DELAY: u64 = 1;

    /// Cycles to arbitrate for a multiplexer.
    pub const ARB_DELAY: u64 = 1;

    /// Cycles to route a flit through a demultiplexer.
    pub const DEMUX_DELAY: u64 = 1;

    /// Cycles to move a packet into or out of a port.
    pub const PACKET_DELAY: u64 = 2;

    /// Switch buffer capacity in flits.
    pub const BUFFER_SIZE: usize = 8;

    /// Port capacity in packets.
    pub const PORT_SIZE: usize = 4;

    /// Free flits required in the next buffer before a head advances.
    pub const BUFFER_THRESHOLD: usize = 2;

    /// Statistics verbosity (0 = summary, 1 = per component, 2 = histograms).
    pub const STATS_LEVEL: u32 = 1;
}

/// Memory consistency model enforced by every processor's memory unit.
///
/// Fixed at startup; does not change during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConsistencyModel {
    /// Sequential consistency: program order among all memory operations.
    Sc,
    /// Processor consistency: store→load reordering allowed, nothing else.
    Pc,
    /// Release consistency: all reordering outside acquire/release bounds.
    #[default]
    Rc,
}

/// L1 write-allocation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum L1WritePolicy {
    /// Stores write the L1 line and mark it dirty.
    #[default]
    WriteBack,
    /// Stores propagate to L2 immediately; L1 lines are never dirty.
    WriteThrough,
}

/// Event-list implementation selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventListKind {
    /// Brown's calendar queue with automatic resizing.
    #[default]
    Calendar,
    /// Sorted linear list; simpler, O(n) insert, useful for debugging.
    Linear,
}

/// Root configuration structure containing all simulator settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Machine-level settings: node count, consistency model, stats.
    pub system: SystemConfig,
    /// Per-processor pipeline parameters.
    pub processor: ProcessorConfig,
    /// Cache hierarchy geometry and MSHR counts.
    pub cache: CacheConfig,
    /// Bus, memory-bank, and directory parameters.
    pub memory: MemoryConfig,
    /// Mesh network timing and buffering.
    pub network: NetworkConfig,
}

/// Machine-level settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SystemConfig {
    /// Number of processor nodes. The mesh is the squarest rectangle that
    /// holds them (`ceil(sqrt(n))` columns).
    pub num_procs: usize,
    /// Consistency model enforced by every node.
    pub consistency_model: ConsistencyModel,
    /// Allow loads to issue speculatively past unresolved operations.
    pub speculative_loads: bool,
    /// Event-list implementation.
    pub event_list_type: EventListKind,
    /// Statistics verbosity (0 = summary, 1 = per component, 2 = histograms).
    pub stats_level: u32,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            num_procs: defaults::NUM_PROCS,
            consistency_model: ConsistencyModel::default(),
            speculative_loads: true,
            event_list_type: EventListKind::default(),
            stats_level: defaults::STATS_LEVEL,
        }
    }
}

/// Per-processor pipeline parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessorConfig {
    /// Instructions fetched per cycle.
    pub fetch_rate: usize,
    /// Instructions retired per cycle.
    pub retire_rate: usize,
    /// Instructions issued to functional units per cycle.
    pub issue_rate: usize,
    /// Active-list (reorder buffer) capacity.
    pub active_list_size: usize,
    /// Physical integer registers.
    pub num_phys_int: usize,
    /// Physical floating-point registers.
    pub num_phys_fp: usize,
    /// SPARC register windows.
    pub num_windows: usize,
    /// Pattern-history-table entries in the branch predictor.
    pub branch_pred_size: usize,
    /// Return-address-stack entries.
    pub ras_size: usize,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            fetch_rate: defaults::FETCH_RATE,
            retire_rate: defaults::RETIRE_RATE,
            issue_rate: defaults::ISSUE_RATE,
            active_list_size: defaults::ACTIVE_LIST_SIZE,
            num_phys_int: defaults::NUM_PHYS_INT,
            num_phys_fp: defaults::NUM_PHYS_FP,
            num_windows: defaults::NUM_WINDOWS,
            branch_pred_size: defaults::BRANCH_PRED_SIZE,
            ras_size: defaults::RAS_SIZE,
        }
    }
}

/// Cache hierarchy geometry and MSHR counts.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// L1 size in bytes.
    pub l1_size: usize,
    /// L1 associativity (ways).
    pub l1_assoc: usize,
    /// L1 write policy.
    pub l1_write_policy: L1WritePolicy,
    /// L1 access latency in cycles.
    pub l1_latency: u64,
    /// L1 miss-status holding registers.
    pub mshrs_l1: usize,
    /// L2 size in bytes. The L2 is inclusive of the L1.
    pub l2_size: usize,
    /// L2 associativity (ways).
    pub l2_assoc: usize,
    /// L2 access latency in cycles.
    pub l2_latency: u64,
    /// L2 miss-status holding registers.
    pub mshrs_l2: usize,
    /// Line size as a power of two (bits).
    pub line_bits: u32,
    /// Write-buffer entries.
    pub write_buffer_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_size: defaults::L1_SIZE,
            l1_assoc: defaults::L1_ASSOC,
            l1_write_policy: L1WritePolicy::default(),
            l1_latency: defaults::L1_LATENCY,
            mshrs_l1: defaults::MSHRS_L1,
            l2_size: defaults::L2_SIZE,
            l2_assoc: defaults::L2_ASSOC,
            l2_latency: defaults::L2_LATENCY,
            mshrs_l2: defaults::MSHRS_L2,
            line_bits: defaults::LINE_BITS,
            write_buffer_size: defaults::WRITE_BUFFER_SIZE,
        }
    }
}

/// Bus, memory-bank, and directory parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MemoryConfig {
    /// Node bus width in bytes.
    pub bus_width: u64,
    /// Node bus base latency in cycles.
    pub bus_latency: u64,
    /// Memory bank access latency in cycles.
    pub mem_latency: u64,
    /// Directory entries per home node.
    pub directory_entries: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            bus_width: defaults::BUS_WIDTH,
            bus_latency: defaults::BUS_LATENCY,
            mem_latency: defaults::MEM_LATENCY,
            directory_entries: defaults::DIRECTORY_ENTRIES,
        }
    }
}

/// Mesh network timing and buffering.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkConfig {
    /// Network cycle time in processor cycles.
    pub network_cycle_time: f64,
    /// Cycles for one flit to traverse a link.
    pub flit_delay: u64,
    /// Cycles to move a flit through a multiplexer.
    pub mux_delay: u64,
    /// Cycles to arbitrate for a multiplexer.
    pub arb_delay: u64,
    /// Cycles to route a flit through a demultiplexer.
    pub demux_delay: u64,
    /// Cycles to move a packet into or out of a port.
    pub packet_delay: u64,
    /// Switch buffer capacity in flits.
    pub buffer_size: usize,
    /// Port capacity in packets.
    pub port_size: usize,
    /// Free flits required downstream before a head advances.
    pub buffer_threshold: usize,
    /// Wait-for-tail mode: the head stalls in each buffer until the tail
    /// catches up (store-and-forward; used for deadlock analysis).
    pub wft: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            network_cycle_time: defaults::NETWORK_CYCLE_TIME,
            flit_delay: defaults::FLIT_DELAY,
            mux_delay: defaults::MUX_DELAY,
            arb_delay: defaults::ARB_DELAY,
            demux_delay: defaults::DEMUX_DELAY,
            packet_delay: defaults::PACKET_DELAY,
            buffer_size: defaults::BUFFER_SIZE,
            port_size: defaults::PORT_SIZE,
            buffer_threshold: defaults::BUFFER_THRESHOLD,
            wft: false,
        }
    }
}

impl Config {
    /// Parses a configuration from a JSON string.
    ///
    /// Unknown fields are rejected so that typos in option names fail loudly
    /// rather than silently falling back to defaults.
    pub fn from_json(text: &str) -> Result<Self, SimError> {
        let cfg: Self =
            serde_json::from_str(text).map_err(|e| SimError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Rejects configurations the machine model does not define.
    pub fn validate(&self) -> Result<(), SimError> {
        if self.system.num_procs == 0 {
            return Err(SimError::Config("num_procs must be at least 1".into()));
        }
        if self.cache.line_bits < 2 || self.cache.line_bits > 12 {
            return Err(SimError::Config(format!(
                "line_bits {} outside supported range 2..=12",
                self.cache.line_bits
            )));
        }
        let line = 1usize << self.cache.line_bits;
        for (name, size, assoc) in [
            ("l1", self.cache.l1_size, self.cache.l1_assoc),
            ("l2", self.cache.l2_size, self.cache.l2_assoc),
        ] {
            if assoc == 0 || size == 0 || size % (line * assoc) != 0 {
                return Err(SimError::Config(format!(
                    "{name}_size {size} is not a whole number of {assoc}-way sets of {line}-byte lines"
                )));
            }
        }
        if self.cache.l2_size < self.cache.l1_size {
            return Err(SimError::Config(
                "inclusive l2 must be at least as large as l1".into(),
            ));
        }
        if self.network.buffer_threshold > self.network.buffer_size {
            // Unspecified regime: a head could never satisfy the threshold.
            return Err(SimError::Config(format!(
                "buffer_threshold {} exceeds buffer_size {}",
                self.network.buffer_threshold, self.network.buffer_size
            )));
        }
        if self.network.network_cycle_time <= 0.0 {
            return Err(SimError::Config("network_cycle_time must be positive".into()));
        }
        if self.processor.active_list_size == 0 || self.processor.retire_rate == 0 {
            return Err(SimError::Config(
                "active_list_size and retire_rate must be nonzero".into(),
            ));
        }
        // Rename needs a free physical register per in-flight destination.
        if self.processor.num_phys_int < 64 + 8 || self.processor.num_phys_fp < 64 {
            return Err(SimError::Config(
                "physical register files too small for the architected state".into(),
            ));
        }
        Ok(())
    }

    /// Mesh geometry for `num_procs` nodes: (columns, rows), row-major ids.
    pub fn mesh_shape(&self) -> (usize, usize) {
        let n = self.system.num_procs;
        let cols = (n as f64).sqrt().ceil() as usize;
        let rows = n.div_ceil(cols);
        (cols, rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_validates() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_from_json_overrides() {
        let cfg = Config::from_json(
            r#"{
                "system": { "num_procs": 4, "consistency_model": "SC" },
                "cache": { "l1_size": 8192, "l1_assoc": 2 },
                "network": { "buffer_size": 16, "buffer_threshold": 4 }
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.system.num_procs, 4);
        assert_eq!(cfg.system.consistency_model, ConsistencyModel::Sc);
        assert_eq!(cfg.cache.l1_size, 8192);
        assert_eq!(cfg.network.buffer_size, 16);
        // Untouched sections keep defaults.
        assert_eq!(cfg.processor.fetch_rate, 4);
    }

    #[test]
    fn test_threshold_over_buffer_rejected() {
        let r = Config::from_json(r#"{ "network": { "buffer_threshold": 99 } }"#);
        assert!(r.is_err());
    }

    #[test]
    fn test_bad_geometry_rejected() {
        let r = Config::from_json(r#"{ "cache": { "l1_size": 1000 } }"#);
        assert!(r.is_err());
    }

    #[test]
    fn test_mesh_shape() {
        let mut cfg = Config::default();
        cfg.system.num_procs = 4;
        assert_eq!(cfg.mesh_shape(), (2, 2));
        cfg.system.num_procs = 6;
        assert_eq!(cfg.mesh_shape(), (3, 2));
        cfg.system.num_procs = 1;
        assert_eq!(cfg.mesh_shape(), (1, 1));
    }
}
