pub const HIGH_PARALLELISM: usize = 6;
pub const MEDIUM_PARALLELISM: usize = 4;
pub const REDUCED_PARALLELISM: usize = 2;
pub const SERIAL_PARALLELISM: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThermalState {
    #[default]
    Nominal,
    Fair,
    Serious,
    Critical,
}

/// Host conditions that bound how much upload work runs at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkloadSignals {
    pub cpu_count: usize,
    pub thermal: ThermalState,
    pub low_power: bool,
    pub extension: bool,
    pub foreground: bool,
}

impl Default for WorkloadSignals {
    fn default() -> Self {
        Self {
            cpu_count: std::thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(MEDIUM_PARALLELISM),
            thermal: ThermalState::Nominal,
            low_power: false,
            extension: false,
            foreground: true,
        }
    }
}

pub fn workload_parallelism(signals: &WorkloadSignals) -> usize {
    if signals.thermal == ThermalState::Critical
        || signals.low_power
        || signals.extension
        || !signals.foreground
    {
        return REDUCED_PARALLELISM;
    }
    let parallelism = signals.cpu_count.clamp(MEDIUM_PARALLELISM, HIGH_PARALLELISM);
    if signals.thermal == ThermalState::Serious {
        return (parallelism / 2).max(REDUCED_PARALLELISM);
    }
    parallelism
}

/// Share of `value` for one lane; idle lanes stay serial.
pub fn split_among_lanes(value: usize, active_lanes: usize, lane_active: bool) -> usize {
    if !lane_active || active_lanes == 0 {
        return SERIAL_PARALLELISM;
    }
    (value / active_lanes).max(SERIAL_PARALLELISM)
}
