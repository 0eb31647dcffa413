//! JSON dumps and human-readable tables of cost model results.

use crate::cost::cumulative::Cme;
use prettytable::{self, format, row};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Only the headline numbers of a result.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct SimpleReport {
    pub energy_total: f64,
    pub latency_total2: u64,
}

impl From<&Cme> for SimpleReport {
    fn from(cme: &Cme) -> Self {
        SimpleReport {
            energy_total: cme.energy_total(),
            latency_total2: cme.latency_total(),
        }
    }
}

/// Every field of the result, pretty-printed. Reads back with `serde_json::from_str::<Cme>`.
pub fn complete_json(cme: &Cme) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(cme)
}

pub fn simple_json(cme: &Cme) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(&SimpleReport::from(cme))
}

/// Print the energy and latency breakdown of a result to stdout.
pub fn pprint(cme: &Cme) {
    println!("{}", Summary(cme));
}

pub fn pprint_string(cme: &Cme) -> String {
    Summary(cme).to_string()
}

struct Summary<'a>(&'a Cme);

impl fmt::Display for Summary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cme = self.0;
        let totals = cme.totals();
        let latency = &totals.latency;
        writeln!(f, "{cme}")?;
        writeln!(
            f,
            "Energy: {:.4e} pJ (MAC {:.4e}, memory {:.4e})",
            totals.energy_total, totals.mac_energy, totals.mem_energy
        )?;
        writeln!(
            f,
            "Latency: {} cycles (ideal {}, spatial stall {}, temporal stall {}, loading {}, offloading {})",
            latency.latency_total2,
            latency.ideal_cycle,
            latency.spatial_stall,
            latency.temporal_stall,
            latency.data_loading_cycle,
            latency.data_offloading_cycle
        )?;
        writeln!(f, "MAC utilization: {:.1}%", 100.0 * latency.mac_utilization2())?;
        write!(f, "{}", breakdown_table(cme))
    }
}

fn breakdown_table(cme: &Cme) -> prettytable::Table {
    let totals = cme.totals();
    let mut table = prettytable::Table::new();
    table.set_titles(row!["Operand", "Level", "Memory", "Energy (pJ)", "tl", "fl", "th", "fh"]);
    for (op, levels) in &totals.mem_energy_breakdown {
        let names = cme.as_layer().and_then(|l| l.memory_levels.get(op));
        let accesses = totals.memory_word_access.get(op);
        for (lv, energy) in levels.iter().enumerate() {
            let name = names.and_then(|n| n.get(lv)).map_or("", String::as_str);
            let mut r = row![op, lv, name, format!("{energy:.4e}")];
            if let Some(access) = accesses.and_then(|a| a.get(lv)) {
                for (_, count) in access.iter() {
                    r.add_cell(prettytable::Cell::new(&format!("{count:.0}")));
                }
            }
            table.add_row(r);
        }
    }

    let format = format::FormatBuilder::new()
        .separator(
            format::LinePosition::Title,
            format::LineSeparator::new('-', ' ', ' ', ' '),
        )
        .column_separator(' ')
        .build();
    table.set_format(format);
    table
}
