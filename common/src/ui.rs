use chrono::{NaiveDateTime, Timelike};
use tracing::{info, warn};

use crate::{
    calibration::{CalibrationEngine, CalibrationStage, DutyMap, ReferenceRun},
    config::DoserConfig,
    schedule::{ScheduleEntry, ScheduleStore},
    types::{Button, ButtonSet, PumpId},
};

pub const SCHEDULES_PER_PAGE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Screen {
    Main,
    SelectPump,
    PumpMenu,
    ViewSchedule,
    AddEditSchedule,
    ManualControl,
    CalibratePump,
    CalibrateInput,
}

impl Screen {
    pub const ALL: [Screen; 8] = [
        Screen::Main,
        Screen::SelectPump,
        Screen::PumpMenu,
        Screen::ViewSchedule,
        Screen::AddEditSchedule,
        Screen::ManualControl,
        Screen::CalibratePump,
        Screen::CalibrateInput,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Main => "MAIN",
            Self::SelectPump => "SELECT_PUMP",
            Self::PumpMenu => "PUMP_MENU",
            Self::ViewSchedule => "VIEW_SCHEDULE",
            Self::AddEditSchedule => "ADD_SCHEDULE",
            Self::ManualControl => "MANUAL_CONTROL",
            Self::CalibratePump => "CALIBRATE_PUMP",
            Self::CalibrateInput => "CALIBRATE_INPUT",
        }
    }

    pub fn is_calibration(self) -> bool {
        matches!(self, Self::CalibratePump | Self::CalibrateInput)
    }

    /// How often the display task re-renders this screen.
    pub fn refresh_interval_ms(self) -> u64 {
        match self {
            Self::CalibratePump | Self::CalibrateInput => 50,
            Self::ManualControl => 100,
            Self::Main => 200,
            _ => 150,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpMenuItem {
    Schedule,
    Calibration,
}

impl PumpMenuItem {
    pub const ALL: [PumpMenuItem; 2] = [PumpMenuItem::Schedule, PumpMenuItem::Calibration];

    pub fn label(self) -> &'static str {
        match self {
            Self::Schedule => "Schedule",
            Self::Calibration => "Calibration",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditField {
    Hour,
    Minute,
    Duration,
    Interval,
}

impl EditField {
    const ORDER: [EditField; 4] = [
        EditField::Hour,
        EditField::Minute,
        EditField::Duration,
        EditField::Interval,
    ];

    fn position(self) -> usize {
        Self::ORDER
            .iter()
            .position(|field| *field == self)
            .unwrap_or(0)
    }

    pub fn next(self) -> Self {
        Self::ORDER[(self.position() + 1) % Self::ORDER.len()]
    }

    pub fn prev(self) -> Self {
        Self::ORDER[(self.position() + Self::ORDER.len() - 1) % Self::ORDER.len()]
    }
}

/// Working copy of the entry shown on the add/edit screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EditBuffer {
    pub hour: u8,
    pub minute: u8,
    pub duration_s: u32,
    pub interval_days: u16,
    pub field: EditField,
    /// Time of the entry being edited; `None` when adding.
    pub original: Option<(u8, u8)>,
}

impl EditBuffer {
    fn new_entry(hour: u8, minute: u8, duration_s: u32) -> Self {
        Self {
            hour,
            minute,
            duration_s,
            interval_days: 1,
            field: EditField::Hour,
            original: None,
        }
    }

    /// The screen edits whole seconds within `1..=max_duration_s`.
    fn from_entry(entry: &ScheduleEntry, max_duration_s: u32) -> Self {
        let duration_s = (entry.duration_ms / 1_000).clamp(1, max_duration_s);
        if u64::from(duration_s) * 1_000 != u64::from(entry.duration_ms) {
            warn!(
                "UI: {:02}:{:02} duration {}ms shown as {duration_s}s; saving will store {}ms",
                entry.hour,
                entry.minute,
                entry.duration_ms,
                u64::from(duration_s) * 1_000
            );
        }
        Self {
            hour: entry.hour,
            minute: entry.minute,
            duration_s,
            interval_days: entry.interval_days,
            field: EditField::Hour,
            original: Some(entry.key()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UiLimits {
    pub inactivity_ms: u64,
    pub max_duration_s: u32,
    pub max_interval_days: u16,
    pub default_duration_s: u32,
}

impl From<&DoserConfig> for UiLimits {
    fn from(config: &DoserConfig) -> Self {
        Self {
            inactivity_ms: config.ui_inactivity_ms,
            max_duration_s: config.max_duration_s,
            max_interval_days: config.max_interval_days,
            default_duration_s: config.default_duration_s,
        }
    }
}

/// Side effects the runtime carries out after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiEffect {
    /// Cancel any timed run on the pump, then flip its manual override.
    ToggleManual(PumpId),
    /// Power off every pump left on by manual control and clear the overrides.
    ReleaseManualPumps,
    PersistSchedules,
    PersistCalibration,
    StartCalibration(ReferenceRun),
    StopCalibration,
    Redraw,
}

/// State the UI reads and mutates while handling input.
pub struct UiContext<'a> {
    pub schedules: &'a mut ScheduleStore,
    pub calibration: &'a mut CalibrationEngine,
    pub duties: &'a mut DutyMap,
    /// Local wall-clock time, `None` until synced.
    pub now: Option<NaiveDateTime>,
}

#[derive(Debug, Clone)]
pub struct UiMachine {
    screen: Screen,
    selected_pump: PumpId,
    manual_pump: PumpId,
    menu_cursor: PumpMenuItem,
    schedule_cursor: usize,
    edit: EditBuffer,
    limits: UiLimits,
    last_action_ms: u64,
}

impl UiMachine {
    pub fn new(limits: UiLimits, now_ms: u64) -> Self {
        Self {
            screen: Screen::Main,
            selected_pump: PumpId::One,
            manual_pump: PumpId::One,
            menu_cursor: PumpMenuItem::Schedule,
            schedule_cursor: 0,
            edit: EditBuffer::new_entry(12, 0, limits.default_duration_s),
            limits,
            last_action_ms: now_ms,
        }
    }

    pub fn screen(&self) -> Screen {
        self.screen
    }

    pub fn selected_pump(&self) -> PumpId {
        self.selected_pump
    }

    pub fn manual_pump(&self) -> PumpId {
        self.manual_pump
    }

    pub fn menu_cursor(&self) -> PumpMenuItem {
        self.menu_cursor
    }

    pub fn schedule_cursor(&self) -> usize {
        self.schedule_cursor
    }

    pub fn edit(&self) -> &EditBuffer {
        &self.edit
    }

    /// Returns to Main after a quiet period. Never fires on Main, on a
    /// calibration screen, or while a calibration is in progress.
    pub fn check_inactivity(
        &mut self,
        now_ms: u64,
        calibration: &CalibrationEngine,
    ) -> Vec<UiEffect> {
        if self.screen == Screen::Main
            || self.screen.is_calibration()
            || calibration.is_active()
            || now_ms.saturating_sub(self.last_action_ms) <= self.limits.inactivity_ms
        {
            return Vec::new();
        }

        info!("UI: inactivity timeout on {}, returning to MAIN", self.screen.as_str());
        self.screen = Screen::Main;
        self.last_action_ms = now_ms;
        vec![UiEffect::ReleaseManualPumps, UiEffect::Redraw]
    }

    /// The measurement worker ran to completion.
    pub fn on_calibration_finished(&mut self, calibration: &mut CalibrationEngine) -> Vec<UiEffect> {
        if !calibration.worker_finished() {
            return Vec::new();
        }
        if self.screen == Screen::CalibratePump {
            self.screen = Screen::CalibrateInput;
        }
        vec![UiEffect::Redraw]
    }

    /// The measurement could not start; nothing is running.
    pub fn on_calibration_rejected(&mut self, calibration: &mut CalibrationEngine) {
        calibration.abort_start();
    }

    /// Keeps the list cursor valid after entries were removed elsewhere.
    pub fn on_schedules_changed(&mut self, pump: PumpId, store: &ScheduleStore) {
        if self.screen == Screen::ViewSchedule && self.selected_pump == pump {
            self.clamp_schedule_cursor(store.len(pump));
        }
    }

    /// `(page, pages)`, both 1-based, for the schedule list.
    pub fn schedule_page(&self, len: usize) -> (usize, usize) {
        let pages = len.div_ceil(SCHEDULES_PER_PAGE).max(1);
        let page = (self.schedule_cursor / SCHEDULES_PER_PAGE + 1).min(pages);
        (page, pages)
    }

    pub fn handle(
        &mut self,
        buttons: ButtonSet,
        now_ms: u64,
        ctx: &mut UiContext<'_>,
    ) -> Vec<UiEffect> {
        if buttons.is_empty() {
            return Vec::new();
        }

        let mut effects = match self.screen {
            Screen::Main => self.on_main(buttons),
            Screen::SelectPump => self.on_select_pump(buttons),
            Screen::PumpMenu => self.on_pump_menu(buttons, ctx),
            Screen::ViewSchedule => self.on_view_schedule(buttons, ctx),
            Screen::AddEditSchedule => self.on_add_edit(buttons, ctx),
            Screen::ManualControl => self.on_manual_control(buttons),
            Screen::CalibratePump => self.on_calibrate_pump(buttons, ctx),
            Screen::CalibrateInput => self.on_calibrate_input(buttons, ctx),
        };

        if let Some(effects) = effects.as_mut() {
            self.last_action_ms = now_ms;
            effects.push(UiEffect::Redraw);
        }
        effects.unwrap_or_default()
    }

    fn on_main(&mut self, buttons: ButtonSet) -> Option<Vec<UiEffect>> {
        if buttons.contains(Button::Select) {
            self.selected_pump = PumpId::One;
            self.screen = Screen::SelectPump;
        } else if buttons.contains(Button::Right) {
            self.manual_pump = PumpId::One;
            self.screen = Screen::ManualControl;
        } else {
            return None;
        }
        Some(Vec::new())
    }

    fn on_select_pump(&mut self, buttons: ButtonSet) -> Option<Vec<UiEffect>> {
        if buttons.contains(Button::Up) || buttons.contains(Button::Down) {
            self.selected_pump = self.selected_pump.other();
        } else if buttons.contains(Button::Select) {
            self.menu_cursor = PumpMenuItem::Schedule;
            self.screen = Screen::PumpMenu;
        } else if is_back(buttons) {
            self.screen = Screen::Main;
        } else {
            return None;
        }
        Some(Vec::new())
    }

    fn on_pump_menu(&mut self, buttons: ButtonSet, ctx: &mut UiContext<'_>) -> Option<Vec<UiEffect>> {
        if buttons.contains(Button::Up) {
            self.menu_cursor = PumpMenuItem::Schedule;
        } else if buttons.contains(Button::Down) {
            self.menu_cursor = PumpMenuItem::Calibration;
        } else if buttons.contains(Button::Select) {
            match self.menu_cursor {
                PumpMenuItem::Schedule => {
                    self.schedule_cursor = 0;
                    self.screen = Screen::ViewSchedule;
                }
                PumpMenuItem::Calibration => {
                    ctx.calibration.reset(self.selected_pump);
                    self.screen = Screen::CalibratePump;
                }
            }
        } else if is_back(buttons) {
            self.screen = Screen::SelectPump;
        } else {
            return None;
        }
        Some(Vec::new())
    }

    fn on_view_schedule(
        &mut self,
        buttons: ButtonSet,
        ctx: &mut UiContext<'_>,
    ) -> Option<Vec<UiEffect>> {
        let pump = self.selected_pump;
        let len = ctx.schedules.len(pump);

        if buttons.contains(Button::Up) {
            if len == 0 {
                return None;
            }
            self.schedule_cursor = self.schedule_cursor.saturating_sub(1);
        } else if buttons.contains(Button::Down) {
            if len == 0 {
                return None;
            }
            self.schedule_cursor = (self.schedule_cursor + 1).min(len - 1);
        } else if buttons.contains(Button::Right) {
            let (hour, minute) = ctx
                .now
                .map(|now| (now.hour() as u8, now.minute() as u8))
                .unwrap_or((12, 0));
            self.edit = EditBuffer::new_entry(hour, minute, self.limits.default_duration_s);
            self.screen = Screen::AddEditSchedule;
        } else if buttons.contains(Button::Select) {
            let entry = *ctx.schedules.entries(pump).get(self.schedule_cursor)?;
            if buttons.contains(Button::Back) {
                if let Err(err) = ctx.schedules.delete(pump, entry.hour, entry.minute) {
                    warn!("UI: delete failed: {err}");
                    return None;
                }
                info!(
                    "UI: deleted {pump} {:02}:{:02} ({}ms, every {} day(s))",
                    entry.hour, entry.minute, entry.duration_ms, entry.interval_days
                );
                self.clamp_schedule_cursor(ctx.schedules.len(pump));
                return Some(vec![UiEffect::PersistSchedules]);
            }
            self.edit = EditBuffer::from_entry(&entry, self.limits.max_duration_s);
            info!("UI: editing {pump} {:02}:{:02}", entry.hour, entry.minute);
            self.screen = Screen::AddEditSchedule;
        } else if is_back(buttons) {
            self.screen = Screen::PumpMenu;
        } else {
            return None;
        }
        Some(Vec::new())
    }

    fn on_add_edit(&mut self, buttons: ButtonSet, ctx: &mut UiContext<'_>) -> Option<Vec<UiEffect>> {
        if buttons.contains(Button::Up) {
            self.adjust_field(true);
        } else if buttons.contains(Button::Down) {
            self.adjust_field(false);
        } else if buttons.contains(Button::Left) {
            self.edit.field = self.edit.field.prev();
        } else if buttons.contains(Button::Right) {
            self.edit.field = self.edit.field.next();
        } else if buttons.contains(Button::Select) {
            return self.save_edit(ctx);
        } else if buttons.contains(Button::Back) {
            self.screen = Screen::ViewSchedule;
        } else {
            return None;
        }
        Some(Vec::new())
    }

    fn adjust_field(&mut self, up: bool) {
        let edit = &mut self.edit;
        match edit.field {
            EditField::Hour => {
                edit.hour = if up {
                    (edit.hour + 1) % 24
                } else {
                    (edit.hour + 23) % 24
                };
            }
            EditField::Minute => {
                edit.minute = if up {
                    (edit.minute + 1) % 60
                } else {
                    (edit.minute + 59) % 60
                };
            }
            EditField::Duration => {
                let next = if up {
                    edit.duration_s.saturating_add(1)
                } else {
                    edit.duration_s.saturating_sub(1)
                };
                edit.duration_s = next.clamp(1, self.limits.max_duration_s);
            }
            EditField::Interval => {
                let next = if up {
                    edit.interval_days.saturating_add(1)
                } else {
                    edit.interval_days.saturating_sub(1)
                };
                edit.interval_days = next.clamp(1, self.limits.max_interval_days);
            }
        }
    }

    fn save_edit(&mut self, ctx: &mut UiContext<'_>) -> Option<Vec<UiEffect>> {
        let pump = self.selected_pump;
        let edit = self.edit;
        let entry = match ScheduleEntry::new(
            edit.hour,
            edit.minute,
            edit.duration_s.saturating_mul(1_000),
            edit.interval_days,
        ) {
            Ok(entry) => entry,
            Err(err) => {
                warn!("UI: cannot save {pump} entry: {err}");
                return None;
            }
        };

        let result = match edit.original {
            Some(original) => ctx.schedules.replace(pump, original, entry),
            None => ctx.schedules.add(pump, entry),
        };

        match result {
            Ok(()) => {
                info!(
                    "UI: saved {pump} {:02}:{:02} ({}ms, every {} day(s))",
                    entry.hour, entry.minute, entry.duration_ms, entry.interval_days
                );
                self.clamp_schedule_cursor(ctx.schedules.len(pump));
                self.screen = Screen::ViewSchedule;
                Some(vec![UiEffect::PersistSchedules])
            }
            Err(err) => {
                warn!("UI: duplicate schedule time rejected: {err}");
                None
            }
        }
    }

    fn on_manual_control(&mut self, buttons: ButtonSet) -> Option<Vec<UiEffect>> {
        if buttons.contains(Button::Up) || buttons.contains(Button::Down) {
            self.manual_pump = self.manual_pump.other();
            Some(Vec::new())
        } else if buttons.contains(Button::Select) {
            Some(vec![UiEffect::ToggleManual(self.manual_pump)])
        } else if is_back(buttons) {
            self.screen = Screen::Main;
            Some(vec![UiEffect::ReleaseManualPumps])
        } else {
            None
        }
    }

    fn on_calibrate_pump(
        &mut self,
        buttons: ButtonSet,
        ctx: &mut UiContext<'_>,
    ) -> Option<Vec<UiEffect>> {
        if buttons.contains(Button::Select) {
            match ctx.calibration.stage() {
                CalibrationStage::Idle => match ctx.calibration.start(ctx.duties) {
                    Ok(run) => Some(vec![UiEffect::StartCalibration(run)]),
                    Err(err) => {
                        warn!("UI: calibration start refused: {err}");
                        None
                    }
                },
                CalibrationStage::Running => {
                    ctx.calibration.stop_early().ok()?;
                    self.screen = Screen::CalibrateInput;
                    Some(vec![UiEffect::StopCalibration])
                }
                CalibrationStage::AwaitingInput => {
                    self.screen = Screen::CalibrateInput;
                    Some(Vec::new())
                }
            }
        } else if is_back(buttons) {
            let mut effects = Vec::new();
            if ctx.calibration.stage() == CalibrationStage::Running {
                effects.push(UiEffect::StopCalibration);
            }
            ctx.calibration.cancel();
            self.screen = Screen::PumpMenu;
            Some(effects)
        } else {
            None
        }
    }

    fn on_calibrate_input(
        &mut self,
        buttons: ButtonSet,
        ctx: &mut UiContext<'_>,
    ) -> Option<Vec<UiEffect>> {
        let calibration = &mut *ctx.calibration;
        if buttons.contains(Button::Up) {
            calibration.increment_digit();
        } else if buttons.contains(Button::Down) {
            calibration.decrement_digit();
        } else if buttons.contains(Button::Left) {
            calibration.cursor_left();
        } else if buttons.contains(Button::Right) {
            calibration.cursor_right();
        } else if buttons.contains(Button::Select) {
            return match calibration.save(ctx.duties) {
                Ok(_) => {
                    self.screen = Screen::PumpMenu;
                    Some(vec![UiEffect::PersistCalibration])
                }
                Err(err) => {
                    warn!("UI: calibration save rejected: {err}");
                    None
                }
            };
        } else if buttons.contains(Button::Back) {
            calibration.cancel();
            self.screen = Screen::CalibratePump;
        } else {
            return None;
        }
        Some(Vec::new())
    }

    fn clamp_schedule_cursor(&mut self, len: usize) {
        self.schedule_cursor = self.schedule_cursor.min(len.saturating_sub(1));
    }
}

fn is_back(buttons: ButtonSet) -> bool {
    buttons.contains(Button::Back) || buttons.contains(Button::Left)
}
