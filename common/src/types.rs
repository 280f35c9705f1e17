use std::fmt;

use serde::{Deserialize, Serialize};

/// One of the two fixed pump channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum PumpId {
    One,
    Two,
}

impl PumpId {
    pub const ALL: [PumpId; 2] = [PumpId::One, PumpId::Two];

    pub fn index(self) -> usize {
        match self {
            Self::One => 0,
            Self::Two => 1,
        }
    }

    /// The 1-based number used on the wire, in file keys and on screen.
    pub fn number(self) -> u8 {
        match self {
            Self::One => 1,
            Self::Two => 2,
        }
    }

    pub fn from_number(number: u8) -> Option<Self> {
        match number {
            1 => Some(Self::One),
            2 => Some(Self::Two),
            _ => None,
        }
    }

    pub fn other(self) -> Self {
        match self {
            Self::One => Self::Two,
            Self::Two => Self::One,
        }
    }
}

impl TryFrom<u8> for PumpId {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::from_number(value).ok_or_else(|| format!("invalid pump id {value}"))
    }
}

impl From<PumpId> for u8 {
    fn from(value: PumpId) -> Self {
        value.number()
    }
}

impl fmt::Display for PumpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.number())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Button {
    Up,
    Down,
    Left,
    Right,
    Select,
    Back,
}

impl Button {
    pub const ALL: [Button; 6] = [
        Button::Up,
        Button::Down,
        Button::Left,
        Button::Right,
        Button::Select,
        Button::Back,
    ];

    pub fn index(self) -> usize {
        match self {
            Self::Up => 0,
            Self::Down => 1,
            Self::Left => 2,
            Self::Right => 3,
            Self::Select => 4,
            Self::Back => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Up => "UP",
            Self::Down => "DOWN",
            Self::Left => "LEFT",
            Self::Right => "RIGHT",
            Self::Select => "SELECT",
            Self::Back => "BACK",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|button| button.as_str().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for Button {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Confirmed presses collected during one dispatch cycle.
///
/// Several buttons may land in the same cycle; screens resolve them in a
/// fixed priority order, which also makes chorded presses observable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ButtonSet {
    pressed: [bool; 6],
}

impl ButtonSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn single(button: Button) -> Self {
        let mut set = Self::default();
        set.insert(button);
        set
    }

    pub fn insert(&mut self, button: Button) {
        self.pressed[button.index()] = true;
    }

    pub fn contains(&self, button: Button) -> bool {
        self.pressed[button.index()]
    }

    /// Clears `button`, returning whether it was set.
    pub fn remove(&mut self, button: Button) -> bool {
        std::mem::replace(&mut self.pressed[button.index()], false)
    }

    pub fn is_empty(&self) -> bool {
        !self.pressed.iter().any(|pressed| *pressed)
    }

    pub fn iter(&self) -> impl Iterator<Item = Button> + '_ {
        Button::ALL
            .into_iter()
            .filter(|button| self.contains(*button))
    }
}

impl FromIterator<Button> for ButtonSet {
    fn from_iter<T: IntoIterator<Item = Button>>(iter: T) -> Self {
        let mut set = Self::default();
        for button in iter {
            set.insert(button);
        }
        set
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpActivity {
    On,
    Off,
}

impl PumpActivity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::On => "ON",
            Self::Off => "OFF",
        }
    }

    pub fn from_on(on: bool) -> Self {
        if on {
            Self::On
        } else {
            Self::Off
        }
    }
}

/// Result of asking the actuator for a timed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    Busy,
}
