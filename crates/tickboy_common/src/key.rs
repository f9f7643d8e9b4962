/// The eight buttons of the DMG handheld.
///
/// Frontends translate their own input events into these; the core's
/// joypad maps them onto the P1 matrix.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum Key {
    Right,
    Left,
    Up,
    Down,
    A,
    B,
    Select,
    Start,
}

impl Key {
    pub const ALL: [Key; 8] = [
        Key::Right,
        Key::Left,
        Key::Up,
        Key::Down,
        Key::A,
        Key::B,
        Key::Select,
        Key::Start,
    ];
}
