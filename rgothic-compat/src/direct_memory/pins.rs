//! Fixed addresses of the original executable and the objects pinned there.

use std::cell::RefCell;
use std::mem::size_of;
use std::rc::Rc;

use serde::Serialize;

use crate::engine::{EngineServices, OGame, StatusBar, ZFontMan, ZTimer, ZView};
use crate::error::Result;
use crate::mem32::{Mem32, PinTarget, Ptr32, SharedPin};

pub const ZTIMER: Ptr32 = Ptr32(0x0099_B3D4);
pub const OGAME_POINTER: Ptr32 = Ptr32(0x00AB_0884);
pub const ZFONTMAN_POINTER: Ptr32 = Ptr32(0x00AB_39D4);
pub const PARSER: Ptr32 = Ptr32(0x00AB_40C0);
pub const SCREEN_POINTER: Ptr32 = Ptr32(0x00AB_6468);

/// Size reserved for `zCParser`.
pub const PARSER_SIZE: u32 = 0x100;

/// `zCParser` field offsets.
pub mod parser {
    /// `symtab.table`: `zCArray<zCPar_Symbol*>`.
    pub const SYMTAB_ARRAY: u32 = 0x14;
    pub const SYMTAB_NUM_ALLOC: u32 = 0x18;
    pub const SYMTAB_NUM_IN_ARRAY: u32 = 0x1C;
    /// Base of the byte-code (`stack.stack`).
    pub const STACK_STACK: u32 = 0x44;
    pub const STACK_STACKPTR: u32 = 0x48;
    pub const STACK_STACKLAST: u32 = 0x4C;
    pub const STACK_STACKSIZE: u32 = 0x50;
}

/// Native entry points the bridge registers with the interpreter.
pub mod native {
    use crate::mem32::Ptr32;

    pub const ZCPARSER_GET_SYMBOL_INT: Ptr32 = Ptr32(0x0079_38C0);
    pub const ZCPARSER_GET_INDEX: Ptr32 = Ptr32(0x0079_3470);
    pub const ZCPARSER_CALL_FUNC: Ptr32 = Ptr32(0x0079_29F0);
    pub const ZCPAR_SYMBOLTABLE_GET_SYMBOL: Ptr32 = Ptr32(0x007A_3E40);
    pub const ZCTIMER_SET_MOTION_FACTOR: Ptr32 = Ptr32(0x0063_6F50);
}

/// Where each engine object ended up.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PinnedTable {
    pub timer: Ptr32,
    pub game: Ptr32,
    pub font_manager: Ptr32,
    pub hp_bar: Ptr32,
    pub mana_bar: Ptr32,
    pub swim_bar: Ptr32,
    pub focus_bar: Ptr32,
    pub screen: Ptr32,
    pub parser: Ptr32,
}

fn pin_object<T: PinTarget + 'static>(
    mem: &mut Mem32,
    object: &Rc<RefCell<T>>,
    address: Ptr32,
    label: &str,
) -> Result<Ptr32> {
    let target: SharedPin = object.clone();
    Ok(mem.pin(target, 0, address, size_of::<T>() as u32, label)?)
}

/// A 4-byte cell at a fixed address holding `value`.
fn pointer_cell(mem: &mut Mem32, at: Ptr32, value: Ptr32, label: &str) -> Result<()> {
    mem.alloc_at(at, 4, label)?;
    mem.write_int(at, value.to_script());
    Ok(())
}

/// Pin every engine singleton and publish the pointer cells legacy code reads.
pub fn pin_engine(mem: &mut Mem32, engine: &EngineServices) -> Result<PinnedTable> {
    let mut table = PinnedTable { timer: pin_object::<ZTimer>(mem, &engine.timer, ZTIMER, "zTimer")?, ..Default::default() };

    table.game = pin_object::<OGame>(mem, &engine.game, Ptr32::NULL, "oGame")?;
    pointer_cell(mem, OGAME_POINTER, table.game, "oGame*")?;

    table.hp_bar = pin_object::<StatusBar>(mem, &engine.hp_bar, Ptr32::NULL, "hpBar")?;
    table.mana_bar = pin_object::<StatusBar>(mem, &engine.mana_bar, Ptr32::NULL, "manaBar")?;
    table.swim_bar = pin_object::<StatusBar>(mem, &engine.swim_bar, Ptr32::NULL, "swimBar")?;
    table.focus_bar = pin_object::<StatusBar>(mem, &engine.focus_bar, Ptr32::NULL, "focusBar")?;
    {
        let mut game = engine.game.borrow_mut();
        game.hp_bar = table.hp_bar.0;
        game.mana_bar = table.mana_bar.0;
        game.swim_bar = table.swim_bar.0;
        game.focus_bar = table.focus_bar.0;
    }

    table.font_manager = pin_object::<ZFontMan>(mem, &engine.font_manager, Ptr32::NULL, "zCFontMan")?;
    pointer_cell(mem, ZFONTMAN_POINTER, table.font_manager, "zfontman*")?;

    table.screen = pin_object::<ZView>(mem, &engine.screen, Ptr32::NULL, "screen")?;
    pointer_cell(mem, SCREEN_POINTER, table.screen, "screen*")?;

    table.parser = mem.alloc_at(PARSER, PARSER_SIZE, "zCParser")?;

    log::debug!("engine objects pinned: {:?}", table);
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::offset_of;

    #[test]
    fn game_pointer_cell_leads_to_status_bars() {
        let mut mem = Mem32::default();
        let engine = EngineServices::default();
        let table = pin_engine(&mut mem, &engine).unwrap();

        let game = mem.read_ptr(OGAME_POINTER);
        assert_eq!(game, table.game);
        let hp = mem.read_ptr(game.offset(offset_of!(OGame, hp_bar) as u32));
        assert_eq!(hp, table.hp_bar);

        engine.hp_bar.borrow_mut().current_value = 42.0;
        assert_eq!(mem.read_float(hp.offset(offset_of!(StatusBar, current_value) as u32)), 42.0);
    }

    #[test]
    fn timer_is_at_its_historical_address() {
        let mut mem = Mem32::default();
        let engine = EngineServices::default();
        pin_engine(&mut mem, &engine).unwrap();

        mem.write_int(ZTIMER.offset(offset_of!(ZTimer, total_time) as u32), 1234);
        assert_eq!(engine.timer.borrow().total_time, 1234);
    }
}
