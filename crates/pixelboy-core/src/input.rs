use crate::interrupts::{Interrupt, Interrupts};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Button {
    Right,
    Left,
    Up,
    Down,
    A,
    B,
    Select,
    Start,
}

impl Button {
    /// Whether the button sits on the action row (P15) rather than the d-pad (P14).
    const fn is_action(self) -> bool {
        matches!(self, Button::A | Button::B | Button::Select | Button::Start)
    }

    /// Bit within its row's low nibble.
    const fn mask(self) -> u8 {
        match self {
            Button::Right | Button::A => 0x01,
            Button::Left | Button::B => 0x02,
            Button::Up | Button::Select => 0x04,
            Button::Down | Button::Start => 0x08,
        }
    }
}

/// Joypad matrix behind FF00.
#[derive(Debug, Clone)]
pub struct Input {
    select: u8,
    /// Active-high pressed bits, one nibble per row.
    dpad: u8,
    actions: u8,
}

impl Input {
    pub fn new() -> Self {
        Self {
            select: 0x30,
            dpad: 0,
            actions: 0,
        }
    }

    pub fn read(&self) -> u8 {
        let mut pressed = 0u8;
        if self.select & 0x10 == 0 {
            pressed |= self.dpad;
        }
        if self.select & 0x20 == 0 {
            pressed |= self.actions;
        }
        0xC0 | self.select | (!pressed & 0x0F)
    }

    pub fn write(&mut self, val: u8) {
        self.select = val & 0x30;
    }

    pub fn press(&mut self, button: Button, interrupts: &mut Interrupts) {
        let row = if button.is_action() {
            &mut self.actions
        } else {
            &mut self.dpad
        };
        let was_pressed = *row & button.mask() != 0;
        *row |= button.mask();
        if !was_pressed {
            interrupts.request(Interrupt::Joypad);
        }
    }

    pub fn release(&mut self, button: Button) {
        let row = if button.is_action() {
            &mut self.actions
        } else {
            &mut self.dpad
        };
        *row &= !button.mask();
    }

    pub fn is_pressed(&self, button: Button) -> bool {
        let row = if button.is_action() {
            self.actions
        } else {
            self.dpad
        };
        row & button.mask() != 0
    }
}

impl Default for Input {
    fn default() -> Self {
        Self::new()
    }
}
