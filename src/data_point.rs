use serde::Serialize;
use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};

/// One of the (up to) three AC lines a meter reports on
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    L1,
    L2,
    L3,
}

impl Phase {
    /// Phases present on a device with `num_phases` lines, in L1..L3 order
    pub fn all(num_phases: u8) -> impl Iterator<Item = Phase> {
        [Phase::L1, Phase::L2, Phase::L3]
            .into_iter()
            .take(num_phases.min(3) as usize)
    }

    pub fn number(self) -> u8 {
        match self {
            Phase::L1 => 1,
            Phase::L2 => 2,
            Phase::L3 => 3,
        }
    }

    /// Key prefix the Shelly EM firmware uses for this line (`a_voltage`, `b_pf`...)
    pub fn device_prefix(self) -> char {
        match self {
            Phase::L1 => 'a',
            Phase::L2 => 'b',
            Phase::L3 => 'c',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PhaseMetric {
    Voltage,
    Current,
    Power,
    PowerFactor,
    EnergyForward,
    EnergyReverse,
}

impl PhaseMetric {
    pub const ALL: [PhaseMetric; 6] = [
        PhaseMetric::Voltage,
        PhaseMetric::Current,
        PhaseMetric::Power,
        PhaseMetric::PowerFactor,
        PhaseMetric::EnergyForward,
        PhaseMetric::EnergyReverse,
    ];

    fn suffix(self) -> &'static str {
        match self {
            PhaseMetric::Voltage => "Voltage",
            PhaseMetric::Current => "Current",
            PhaseMetric::Power => "Power",
            PhaseMetric::PowerFactor => "PowerFactor",
            PhaseMetric::EnergyForward => "Energy/Forward",
            PhaseMetric::EnergyReverse => "Energy/Reverse",
        }
    }
}

/// Every data point the adapter publishes. The bus path is the `Display` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DataPath {
    Role,
    AllowedRoles,
    IsGenericEnergyMeter,
    Position,
    DeviceInstance,
    Serial,
    ProductId,
    ProductName,
    CustomName,
    Connected,
    AcEnergyForward,
    AcEnergyReverse,
    AcPower,
    Phase(Phase, PhaseMetric),
    /// Requested relay state, 0 or 1
    OutputState,
    /// Relay state as last reported by the device
    OutputStatus,
    OutputName,
}

impl fmt::Display for DataPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataPath::Role => f.write_str("/Role"),
            DataPath::AllowedRoles => f.write_str("/AllowedRoles"),
            DataPath::IsGenericEnergyMeter => f.write_str("/IsGenericEnergyMeter"),
            DataPath::Position => f.write_str("/Position"),
            DataPath::DeviceInstance => f.write_str("/DeviceInstance"),
            DataPath::Serial => f.write_str("/Serial"),
            DataPath::ProductId => f.write_str("/ProductId"),
            DataPath::ProductName => f.write_str("/ProductName"),
            DataPath::CustomName => f.write_str("/CustomName"),
            DataPath::Connected => f.write_str("/Connected"),
            DataPath::AcEnergyForward => f.write_str("/Ac/Energy/Forward"),
            DataPath::AcEnergyReverse => f.write_str("/Ac/Energy/Reverse"),
            DataPath::AcPower => f.write_str("/Ac/Power"),
            DataPath::Phase(phase, metric) => {
                write!(f, "/Ac/L{}/{}", phase.number(), metric.suffix())
            }
            DataPath::OutputState => f.write_str("/SwitchableOutput/0/State"),
            DataPath::OutputStatus => f.write_str("/SwitchableOutput/0/Status"),
            DataPath::OutputName => f.write_str("/SwitchableOutput/0/Name"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Double(f64),
    Integer(i64),
    Text(String),
    TextArray(Vec<String>),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(v) => Some(*v),
            Value::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => Some(*v),
            // Bus clients often send whole numbers as doubles
            Value::Double(v) if v.fract() == 0.0 => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }
}

/// A registered item. `value == None` means "no data" (invalid on the bus).
#[derive(Debug, Clone, PartialEq)]
pub struct DataPoint {
    pub value: Option<Value>,
    pub writeable: bool,
}

/// Shared store of published data points
///
/// Cloning hands out another handle to the same items. Writes made during an
/// update cycle go through a [`Transaction`] so that readers see either all of
/// them or none.
#[derive(Clone, Default)]
pub struct DataPointRegistry {
    items: Arc<Mutex<BTreeMap<DataPath, DataPoint>>>,
}

impl DataPointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<DataPath, DataPoint>> {
        // Nothing panics between reading and writing a batch, so a poisoned map is still consistent
        self.items.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers (or re-registers) a data point with its initial value
    pub fn add_item(&self, path: DataPath, initial: Option<Value>, writeable: bool) {
        self.lock().insert(
            path,
            DataPoint {
                value: initial,
                writeable,
            },
        );
    }

    pub fn remove_item(&self, path: DataPath) -> Option<DataPoint> {
        self.lock().remove(&path)
    }

    pub fn get_item(&self, path: DataPath) -> Option<DataPoint> {
        self.lock().get(&path).cloned()
    }

    pub fn value(&self, path: DataPath) -> Option<Value> {
        self.lock().get(&path).and_then(|item| item.value.clone())
    }

    pub fn is_registered(&self, path: DataPath) -> bool {
        self.lock().contains_key(&path)
    }

    pub fn is_writeable(&self, path: DataPath) -> bool {
        self.lock().get(&path).is_some_and(|item| item.writeable)
    }

    /// Updates the cached value of a registered item without a transaction.
    /// Returns false when the path has not been registered.
    pub fn set_local_value(&self, path: DataPath, value: Option<Value>) -> bool {
        match self.lock().get_mut(&path) {
            Some(item) => {
                item.value = value;
                true
            }
            None => false,
        }
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn transaction(&self) -> Transaction<'_> {
        Transaction {
            registry: self,
            staged: BTreeMap::new(),
        }
    }

    /// Bus path -> value view of everything currently published
    pub fn snapshot(&self) -> BTreeMap<String, Option<Value>> {
        self.lock()
            .iter()
            .map(|(path, item)| (path.to_string(), item.value.clone()))
            .collect()
    }
}

/// Batch of writes applied to the registry in one step by [`Transaction::commit`].
/// Dropping a transaction without committing discards it.
pub struct Transaction<'a> {
    registry: &'a DataPointRegistry,
    staged: BTreeMap<DataPath, Option<Value>>,
}

impl Transaction<'_> {
    pub fn set(&mut self, path: DataPath, value: Option<Value>) {
        self.staged.insert(path, value);
    }

    pub fn set_f64(&mut self, path: DataPath, value: Option<f64>) {
        self.set(path, value.map(Value::Double));
    }

    /// Reads through the staged writes, falling back to the published value
    pub fn value(&self, path: DataPath) -> Option<Value> {
        match self.staged.get(&path) {
            Some(staged) => staged.clone(),
            None => self.registry.value(path),
        }
    }

    /// Numeric value of `path`, with "no data" and unregistered paths read as 0
    pub fn f64_or_zero(&self, path: DataPath) -> f64 {
        self.value(path).and_then(|v| v.as_f64()).unwrap_or(0.0)
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    pub fn commit(self) {
        let mut items = self.registry.lock();
        for (path, value) in self.staged {
            match items.get_mut(&path) {
                Some(item) => item.value = value,
                None => tracing::warn!("Item {} not found in registry, dropping write", path),
            }
        }
    }
}
