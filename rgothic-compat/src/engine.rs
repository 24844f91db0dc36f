//! Engine objects that legacy extensions reach through fixed addresses.
//!
//! Every struct here reproduces the field layout of the original executable; the
//! offsets are part of the contract with compiled mods. The engine owns the objects
//! and hands them to the bridge as [`EngineServices`].

use std::cell::RefCell;
use std::rc::Rc;

use bytemuck::{Pod, Zeroable};

use crate::impl_pin_target_pod;

/// `zCTimer`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct ZTimer {
    pub factor_motion: f32,
    pub frame_time_float: f32,
    pub total_time_float: f32,
    pub frame_time_float_secs: f32,
    pub total_time_float_secs: f32,
    pub last_timer: u32,
    pub frame_time: u32,
    pub total_time: u32,
    pub min_frame_time: u32,
    pub force_frame_time: u32,
}

impl Default for ZTimer {
    fn default() -> Self {
        Self { factor_motion: 1.0, ..Zeroable::zeroed() }
    }
}

impl ZTimer {
    /// Advance by `ms` milliseconds of real time.
    pub fn tick(&mut self, ms: u32) {
        let scaled = ms as f32 * self.factor_motion;
        self.frame_time = ms;
        self.total_time = self.total_time.wrapping_add(ms);
        self.frame_time_float = scaled;
        self.total_time_float += scaled;
        self.frame_time_float_secs = scaled / 1000.0;
        self.total_time_float_secs = self.total_time_float / 1000.0;
        self.last_timer = self.total_time;
    }
}

/// `zCView`, kept opaque.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct ZView {
    pub data: [u32; 64],
}

impl Default for ZView {
    fn default() -> Self {
        Zeroable::zeroed()
    }
}

/// `oCViewStatusBar`: a view followed by the bar state.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct StatusBar {
    pub view: ZView,
    pub min_low: f32,
    pub max_high: f32,
    pub low: f32,
    pub high: f32,
    pub preview_value: f32,
    pub current_value: f32,
    pub scale: f32,
    pub range_bar: u32,
    pub value_bar: u32,
}

impl Default for StatusBar {
    fn default() -> Self {
        Self { max_high: 100.0, high: 100.0, scale: 1.0, ..Zeroable::zeroed() }
    }
}

/// The leading part of `oCGame` (including its `zCSession` base) up to the
/// player status flag.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct OGame {
    pub vtable: u32,
    pub cs_man: u32,
    pub world: u32,
    pub camera: u32,
    pub ai_cam: u32,
    pub cam_vob: u32,
    pub viewport: u32,
    pub cliprange: f32,
    pub fogrange: f32,
    pub in_script_startup: i32,
    pub in_load_save_game: i32,
    pub in_level_change: i32,
    pub array_view: [u32; 6],
    pub array_view_visible: [i32; 6],
    pub array_view_enabled: [i32; 6],
    pub savegame_manager: u32,
    pub game_text: u32,
    pub load_screen: u32,
    pub save_screen: u32,
    pub pause_screen: u32,
    pub hp_bar: u32,
    pub swim_bar: u32,
    pub mana_bar: u32,
    pub focus_bar: u32,
    pub show_player_status: i32,
    pub game_drawall: i32,
    pub single_step: i32,
}

impl Default for OGame {
    fn default() -> Self {
        Self { cliprange: 16000.0, fogrange: 4000.0, show_player_status: 1, game_drawall: 1, ..Zeroable::zeroed() }
    }
}

/// `zCFontMan`: a `zCArray<zCFont*>`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
pub struct ZFontMan {
    pub fonts: u32,
    pub num_alloc: i32,
    pub num_in_array: i32,
}

impl_pin_target_pod!(ZTimer, ZView, StatusBar, OGame, ZFontMan);

/// Engine singletons shared with the bridge.
#[derive(Debug, Clone, Default)]
pub struct EngineServices {
    pub timer: Rc<RefCell<ZTimer>>,
    pub game: Rc<RefCell<OGame>>,
    pub font_manager: Rc<RefCell<ZFontMan>>,
    pub hp_bar: Rc<RefCell<StatusBar>>,
    pub mana_bar: Rc<RefCell<StatusBar>>,
    pub swim_bar: Rc<RefCell<StatusBar>>,
    pub focus_bar: Rc<RefCell<StatusBar>>,
    pub screen: Rc<RefCell<ZView>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{offset_of, size_of};

    #[test]
    fn layouts_match_the_executable() {
        assert_eq!(size_of::<ZTimer>(), 40);
        assert_eq!(offset_of!(ZTimer, total_time), 28);
        assert_eq!(size_of::<ZView>(), 0x100);
        assert_eq!(offset_of!(StatusBar, current_value), 0x114);
        assert_eq!(offset_of!(OGame, hp_bar), 0x8C);
        assert_eq!(offset_of!(OGame, focus_bar), 0x98);
        assert_eq!(size_of::<ZFontMan>(), 12);
    }

    #[test]
    fn timer_tick_scales_float_times() {
        let mut t = ZTimer { factor_motion: 0.5, ..ZTimer::default() };
        t.tick(100);
        assert_eq!(t.total_time, 100);
        assert_eq!(t.frame_time_float, 50.0);
    }
}
