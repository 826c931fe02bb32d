//! End-of-run statistics report.
//!
//! The report is plain text, one section per component class, driven by
//! `stats_level`: 0 prints the per-processor summaries only, 1 adds the
//! memory system and network, 2 adds histograms and per-buffer channel
//! utilization.

use std::fmt::Write as _;

use crate::mem::HandledBy;

use super::simulator::Simulator;

/// Labels for the handled-by classification, indexed by discriminant.
const HANDLED_NAMES: [&str; 7] = [
    "unknown", "l1", "wbuf", "l2", "local_mem", "remote_home", "remote_owner",
];

impl Simulator {
    /// Renders the statistics report.
    pub fn report(&self) -> String {
        let level = self.cfg.system.stats_level;
        let mut out = String::new();
        let t = self.driver.now();
        let _ = writeln!(out, "==========================================================");
        let _ = writeln!(out, "MULTIPROCESSOR SIMULATION STATISTICS");
        let _ = writeln!(out, "==========================================================");
        let _ = writeln!(out, "sim_time                 {t:.1} cycles");
        let _ = writeln!(out, "procs                    {}", self.procs.len());

        for p in &self.procs {
            let s = &p.stats;
            let cyc = s.cycles.max(1);
            let _ = writeln!(out, "----------------------------------------------------------");
            let _ = writeln!(out, "PROCESSOR {}", p.id);
            let _ = writeln!(out, "  cycles                 {}", s.cycles);
            let _ = writeln!(out, "  instructions           {}", s.retired);
            let _ = writeln!(
                out,
                "  ipc                    {:.4}",
                s.retired as f64 / cyc as f64
            );
            let _ = writeln!(
                out,
                "  reads {:<8} writes {:<8} rmws {:<8}",
                s.loads, s.stores, s.rmws
            );
            let _ = writeln!(
                out,
                "  branches               {} (mispredict {})",
                s.branches, s.mispredicts
            );
            let _ = writeln!(
                out,
                "  squashes               {} (speculation {})",
                s.squashes, s.spec_squashes
            );
            if s.stack_grows > 0 {
                let _ = writeln!(out, "  stack_grows            {}", s.stack_grows);
            }
            if s.window_traps > 0 {
                let _ = writeln!(out, "  window_traps           {}", s.window_traps);
            }
            s.read_lat.report(&mut out, level);
            s.write_lat.report(&mut out, level);
            s.rmw_lat.report(&mut out, level);
            let _ = write!(out, "  handled:");
            for (k, name) in HANDLED_NAMES.iter().enumerate() {
                if s.handled[k] > 0 {
                    let _ = write!(out, " {name}={}", s.handled[k]);
                }
            }
            let _ = writeln!(out);
            let mu = &p.mu.stats;
            let _ = writeln!(
                out,
                "  memunit: issued={} spec={} fwd={} cohe_squash={} repl_squash={}",
                mu.loads_issued, mu.spec_loads, mu.forwards, mu.cohe_squashes, mu.repl_squashes
            );
        }

        if level >= 1 {
            for (id, n) in self.nodes.iter().enumerate() {
                let _ = writeln!(out, "----------------------------------------------------------");
                let _ = writeln!(out, "NODE {id} MEMORY");
                let l1 = &n.l1.stats;
                let l1_total = l1.hits + l1.miss_primary + l1.miss_secondary;
                let _ = writeln!(
                    out,
                    "  l1: accesses={} hits={} ({:.2}%) miss_p={} miss_s={} mshr_full={} port_full={} invals={}",
                    l1_total,
                    l1.hits,
                    100.0 * l1.hits as f64 / l1_total.max(1) as f64,
                    l1.miss_primary,
                    l1.miss_secondary,
                    l1.mshr_full,
                    l1.port_full,
                    l1.invals,
                );
                let l2 = &n.l2.stats;
                let l2_total = l2.hits + l2.miss_primary + l2.miss_secondary;
                let _ = writeln!(
                    out,
                    "  l2: accesses={} hits={} ({:.2}%) miss_p={} miss_s={} rejected={} invals={} wb={}",
                    l2_total,
                    l2.hits,
                    100.0 * l2.hits as f64 / l2_total.max(1) as f64,
                    l2.miss_primary,
                    l2.miss_secondary,
                    l2.rejected,
                    l2.invals,
                    l2.writebacks,
                );
                let _ = writeln!(
                    out,
                    "  wbuf: stores={} coalesced={} forwards={}",
                    n.wb.stores_accepted, n.wb.stores_coalesced, n.wb.forwards
                );
                let d = &n.dir.stats;
                let _ = writeln!(
                    out,
                    "  dir: requests={} queued={} forwards={} invals={} writebacks={}",
                    d.requests, d.queued, d.forwards, d.invals_sent, d.writebacks
                );
                let _ = writeln!(
                    out,
                    "  bus: transactions={} busy={:.2}%  mem: accesses={} busy={:.2}%",
                    n.bus.transactions,
                    100.0 * n.bus.busy.mean(),
                    n.mem.accesses,
                    100.0 * n.mem.busy.mean(),
                );
                if n.pref_issued + n.pref_dropped > 0 {
                    let _ = writeln!(
                        out,
                        "  prefetch: issued={} dropped={} late={}",
                        n.pref_issued, n.pref_dropped, n.pref_late
                    );
                }
            }

            for (name, m) in [("REQUEST NET", &self.meshes[0]), ("REPLY NET", &self.meshes[1])] {
                let _ = writeln!(out, "----------------------------------------------------------");
                let _ = writeln!(out, "{name}");
                let _ = writeln!(out, "  packets                {}", m.stats.delivered);
                m.stats.size.report(&mut out, level);
                m.stats.hops.report(&mut out, level);
                m.stats.lifetime.report(&mut out, level);
                m.stats.blocked.report(&mut out, level);
                if level >= 2 {
                    m.for_each_stat(|s| {
                        if s.samples() > 0 {
                            s.report(&mut out, 0);
                        }
                    });
                }
            }
        }
        let _ = writeln!(out, "==========================================================");
        out
    }

    /// Sanity check used by the validation suite: the handled-by label
    /// table covers every classification.
    pub fn handled_name(h: HandledBy) -> &'static str {
        HANDLED_NAMES[h as usize]
    }
}
