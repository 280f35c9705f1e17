//! Screen text composition and the display boundary.

use chrono::{NaiveDateTime, Timelike};
use tracing::debug;

use doser_common::{
    calibration::CalibrationProgress,
    ui::{EditField, PumpMenuItem, SCHEDULES_PER_PAGE},
    CalibrationEngine, CalibrationStage, DutyMap, PumpId, ScheduleEntry, ScheduleStore, Screen,
    UiMachine,
};

use crate::pump::PumpMode;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    pub lines: Vec<String>,
}

impl Frame {
    fn push(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }
}

pub trait Display: Send {
    /// `full` asks for a complete repaint instead of an incremental one.
    fn render(&mut self, frame: &Frame, full: bool) -> anyhow::Result<()>;
}

/// Host panel: logs every frame it is asked to show.
#[derive(Debug, Default)]
pub struct ConsoleDisplay {
    frames: u64,
}

impl Display for ConsoleDisplay {
    fn render(&mut self, frame: &Frame, full: bool) -> anyhow::Result<()> {
        self.frames += 1;
        debug!(
            "display #{}{}: {}",
            self.frames,
            if full { " (full)" } else { "" },
            frame.lines.join(" | ")
        );
        Ok(())
    }
}

/// Everything a frame depends on, borrowed from the core for one render.
pub struct FrameView<'a> {
    pub ui: &'a UiMachine,
    pub schedules: &'a ScheduleStore,
    pub calibration: &'a CalibrationEngine,
    pub duties: &'a DutyMap,
    pub progress: CalibrationProgress,
    pub pumps: [PumpMode; 2],
    pub now: Option<NaiveDateTime>,
    pub bus_connected: bool,
}

pub fn compose(view: &FrameView<'_>) -> Frame {
    let mut frame = Frame::default();
    match view.ui.screen() {
        Screen::Main => main_screen(view, &mut frame),
        Screen::SelectPump => {
            frame.push("Select Pump");
            for pump in PumpId::ALL {
                let marker = if pump == view.ui.selected_pump() { '*' } else { ' ' };
                frame.push(format!("{marker} Pump {}", pump.number()));
            }
            frame.push("UP/DN, SEL, BCK");
        }
        Screen::PumpMenu => {
            frame.push(format!("Pump {} Menu", view.ui.selected_pump().number()));
            for item in PumpMenuItem::ALL {
                let marker = if item == view.ui.menu_cursor() { '>' } else { ' ' };
                frame.push(format!("{marker}{}", item.label()));
            }
            frame.push("U/D Sel, SEL OK, L Back");
        }
        Screen::ViewSchedule => schedule_list(view, &mut frame),
        Screen::AddEditSchedule => edit_screen(view, &mut frame),
        Screen::ManualControl => {
            frame.push("Manual Control");
            for pump in PumpId::ALL {
                let marker = if pump == view.ui.manual_pump() { '>' } else { ' ' };
                let mode = view.pumps[pump.index()];
                let state = if mode == PumpMode::Off { "OFF" } else { "ON" };
                let tag = if mode == PumpMode::Timed { " (Sched)" } else { "" };
                frame.push(format!("{marker}Pump {}: {state}{tag}", pump.number()));
            }
            frame.push("U/D Sel, SEL Tog, L Exit");
        }
        Screen::CalibratePump => calibrate_screen(view, &mut frame),
        Screen::CalibrateInput => measured_input(view.calibration, &mut frame),
    }
    frame
}

fn main_screen(view: &FrameView<'_>, frame: &mut Frame) {
    let bus = if view.bus_connected { "M:On" } else { "M:Off" };
    match view.now {
        Some(now) => {
            frame.push(format!("{} {bus}", now.format("%Y-%m-%d")));
            frame.push(now.format("%H:%M:%S").to_string());
        }
        None => {
            frame.push(format!("----------- {bus}"));
            frame.push("--:--:--");
        }
    }

    let pumps: Vec<String> = PumpId::ALL
        .into_iter()
        .map(|pump| {
            let on = view.pumps[pump.index()] != PumpMode::Off;
            format!("{pump}:{}", if on { "On" } else { "Off" })
        })
        .collect();
    frame.push(pumps.join("  "));

    let next = view
        .now
        .and_then(|now| next_dose(view.schedules, now))
        .map(|(pump, entry)| format!("Next: {pump} {:02}:{:02}", entry.hour, entry.minute))
        .unwrap_or_else(|| "Next: --:--".to_string());
    frame.push(next);
    frame.push("SEL->Menu R->Manual");
}

/// The first dose strictly after the current minute, or tomorrow's earliest
/// when nothing is left today. Ties go to the lower pump number.
pub fn next_dose(store: &ScheduleStore, now: NaiveDateTime) -> Option<(PumpId, ScheduleEntry)> {
    let current = (now.hour() * 60 + now.minute()) as u16;
    let all = PumpId::ALL
        .into_iter()
        .flat_map(|pump| store.entries(pump).iter().map(move |entry| (pump, *entry)));

    let mut later_today: Option<(PumpId, ScheduleEntry)> = None;
    let mut earliest: Option<(PumpId, ScheduleEntry)> = None;
    for candidate in all {
        let minute = candidate.1.minute_of_day();
        if minute > current
            && later_today.map_or(true, |best| minute < best.1.minute_of_day())
        {
            later_today = Some(candidate);
        }
        if earliest.map_or(true, |best| minute < best.1.minute_of_day()) {
            earliest = Some(candidate);
        }
    }
    later_today.or(earliest)
}

fn schedule_list(view: &FrameView<'_>, frame: &mut Frame) {
    let pump = view.ui.selected_pump();
    let entries = view.schedules.entries(pump);
    if entries.is_empty() {
        frame.push(format!("Pump {} Schedule", pump.number()));
        frame.push("No schedules.");
        frame.push("RIGHT -> Add New");
        frame.push("L<- Back");
        return;
    }

    let (page, pages) = view.ui.schedule_page(entries.len());
    frame.push(format!("Pump {} Schedule {page}/{pages}", pump.number()));
    let start = (page - 1) * SCHEDULES_PER_PAGE;
    for (index, entry) in entries
        .iter()
        .enumerate()
        .skip(start)
        .take(SCHEDULES_PER_PAGE)
    {
        let marker = if index == view.ui.schedule_cursor() { '>' } else { ' ' };
        frame.push(format!("{marker}{}", entry_label(entry)));
    }
    frame.push("U/D Nav, R->Add");
    frame.push("SEL->Edit, L->Back");
}

fn entry_label(entry: &ScheduleEntry) -> String {
    let seconds = entry.duration_ms / 1_000;
    if entry.interval_days == 1 {
        format!("{:02}:{:02} ({seconds}s)", entry.hour, entry.minute)
    } else {
        format!(
            "{:02}:{:02} ({seconds}s/{}d)",
            entry.hour, entry.minute, entry.interval_days
        )
    }
}

fn edit_screen(view: &FrameView<'_>, frame: &mut Frame) {
    let edit = view.ui.edit();
    let verb = if edit.original.is_some() { "Edit" } else { "Add" };
    frame.push(format!("{verb} {} Sched", view.ui.selected_pump()));
    frame.push(format!("  {:02}:{:02}", edit.hour, edit.minute));
    frame.push(match edit.field {
        EditField::Hour => "  ^^",
        EditField::Minute => "     ^^",
        EditField::Duration | EditField::Interval => "",
    });
    let marker = |field: EditField| if edit.field == field { '>' } else { ' ' };
    frame.push(format!("{}Dur:{:>3}s", marker(EditField::Duration), edit.duration_s));
    frame.push(format!("{}Int:{:>3}d", marker(EditField::Interval), edit.interval_days));
    frame.push("U/D Val(+/-1s), L/R");
    frame.push("SEL Save, BCK Cancel");
}

fn calibrate_screen(view: &FrameView<'_>, frame: &mut Frame) {
    let calibration = view.calibration;
    let pump = calibration.pump();
    let duration_s = calibration.reference_duration_ms() / 1_000;
    frame.push(format!("Calibrate Pump {}", pump.number()));
    match calibration.stage() {
        CalibrationStage::Idle => {
            frame.push("Ready to calibrate");
            frame.push(format!(
                "Will run {}ml for {duration_s}s",
                calibration.reference_ml()
            ));
            frame.push(format!("Current PWM: {}", view.duties.get(pump)));
            frame.push("SEL Start, L Back");
        }
        CalibrationStage::Running => {
            frame.push("Calibrating...");
            frame.push(format!(
                "Time: {}s / {duration_s}s",
                view.progress.elapsed_s
            ));
            frame.push(format!("Remaining: {}s", view.progress.remaining_s));
            frame.push("SEL Stop Early");
        }
        CalibrationStage::AwaitingInput => {
            frame.push("Calibration done!");
            frame.push("Ready to input");
            frame.push("actual ml amount");
            frame.push("SEL Continue");
        }
    }
}

fn measured_input(calibration: &CalibrationEngine, frame: &mut Frame) {
    frame.push("Enter actual ml:");
    let digits = format!("{:03}", calibration.measured_ml());
    let cursor = usize::from(calibration.digit_cursor());
    let rendered: String = digits
        .chars()
        .enumerate()
        .map(|(index, digit)| {
            if index == cursor {
                format!("[{digit}]")
            } else {
                format!(" {digit} ")
            }
        })
        .collect();
    frame.push(format!("{rendered} ml"));
    frame.push("U/D Change Digit");
    frame.push("L/R Move Cursor");
    frame.push("SEL Save, BCK Cancel");
}
