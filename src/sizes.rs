use std::fmt;

/// The size measures supported for a process, file or ELF memory range,
/// ordered by usefulness.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Measure {
    EffectiveResident,
    EffectiveMapped,
    Writable,
    Vm,
    SoleMapped,
    Mapped,
    Resident,
}

impl Measure {
    pub const ALL: [Measure; 7] = [
        Measure::EffectiveResident,
        Measure::EffectiveMapped,
        Measure::Writable,
        Measure::Vm,
        Measure::SoleMapped,
        Measure::Mapped,
        Measure::Resident,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Measure::EffectiveResident => "Effective Resident",
            Measure::EffectiveMapped => "Effective Mapped",
            Measure::Writable => "Writable",
            Measure::Vm => "VM",
            Measure::SoleMapped => "Sole Mapped",
            Measure::Mapped => "Mapped",
            Measure::Resident => "Resident",
        }
    }

    /// Column label for a display layer using the given scale,
    /// e.g. `Effective Resident (K)`.
    pub fn label(self, scale: Scale) -> String {
        match scale.suffix() {
            "" => self.name().to_string(),
            suffix => format!("{} ({})", self.name(), suffix),
        }
    }
}

/// A set of byte totals, one per [`Measure`]. The core stays unit-free;
/// scaling for display is the caller's concern via [`Scale`].
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Sizes {
    values: [u64; Measure::ALL.len()],
}

impl Sizes {
    pub fn new() -> Self {
        Sizes::default()
    }

    pub fn get(&self, which: Measure) -> u64 {
        self.values[which as usize]
    }

    pub fn increase(&mut self, which: Measure, bytes: u64) {
        self.values[which as usize] += bytes;
    }

    /// Pairwise addition.
    pub fn add(&mut self, other: &Sizes) {
        for (v, o) in self.values.iter_mut().zip(&other.values) {
            *v += o;
        }
    }
}

impl fmt::Debug for Sizes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Sizes");
        for m in Measure::ALL {
            s.field(m.name(), &self.get(m));
        }
        s.finish()
    }
}

/// Unit scaling for display. Kept out of [`Sizes`] so that accounting code
/// never depends on presentation state.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum Scale {
    #[default]
    Bytes,
    Kilobytes,
    Megabytes,
}

impl Scale {
    pub fn factor(self) -> u64 {
        match self {
            Scale::Bytes => 1,
            Scale::Kilobytes => 1024,
            Scale::Megabytes => 1024 * 1024,
        }
    }

    pub fn suffix(self) -> &'static str {
        match self {
            Scale::Bytes => "",
            Scale::Kilobytes => "K",
            Scale::Megabytes => "M",
        }
    }

    pub fn apply(self, bytes: u64) -> f64 {
        bytes as f64 / self.factor() as f64
    }
}
