//! Deterministic stand-ins for the acquisition board and the serial
//! updater. They back the `--simulate` mode of the system binaries and
//! record every call so tests can assert on the exact sequence the core
//! issued.

use crate::{
    devices::hardware::{
        camera::{Updater, IDENTIFY_COMMAND, QUIT_SENTINEL},
        framegrabber::{
            BoardField, BufferHandle, DisplayHandle, FrameGrabber, FrameTarget, FRAME_WAIT_TIMEOUT,
        },
    },
    error::{CameraError, Result},
};
use std::{collections::HashMap, fs, path::Path, time::Duration};

/// A board call as observed by [`SimulatedGrabber`]. Frame reads and draws
/// are counted rather than recorded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BoardCall {
    AllocateBuffer { size_bytes: u64, frames: u32 },
    FreeBuffer(BufferHandle),
    CreateDisplay { bit_depth: u8, width: u32, height: u32 },
    CloseDisplay(DisplayHandle),
    SetParameter(BoardField, i64),
    AcquireStart(BufferHandle, FrameTarget),
    AcquireStop,
}

struct SimBuffer {
    frame_bytes: usize,
    depth: u32,
    scratch: Vec<u8>,
}

/// Simulated board. While acquiring, every frame index query advances the
/// capture by `frames_per_poll` frames, capped at a finite target.
pub struct SimulatedGrabber {
    calls: Vec<BoardCall>,
    parameters: HashMap<BoardField, i64>,
    buffers: HashMap<BufferHandle, SimBuffer>,
    displays: Vec<DisplayHandle>,
    next_handle: u64,
    acquiring: Option<(BufferHandle, FrameTarget)>,
    last_frame: i64,
    frames_per_poll: i64,
    frames_drawn: u64,
    fail_allocation: bool,
    fail_display: bool,
    fail_at_frame: Option<i64>,
    stall_at_frame: Option<i64>,
}

impl Default for SimulatedGrabber {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedGrabber {
    pub fn new() -> Self {
        Self {
            calls: Vec::new(),
            parameters: HashMap::new(),
            buffers: HashMap::new(),
            displays: Vec::new(),
            next_handle: 1,
            acquiring: None,
            last_frame: 0,
            frames_per_poll: 1,
            frames_drawn: 0,
            fail_allocation: false,
            fail_display: false,
            fail_at_frame: None,
            stall_at_frame: None,
        }
    }

    pub fn with_frames_per_poll(mut self, frames: i64) -> Self {
        self.frames_per_poll = frames.max(1);
        self
    }

    /// Every subsequent buffer allocation fails.
    pub fn fail_allocation(&mut self, fail: bool) {
        self.fail_allocation = fail;
    }

    /// Every subsequent display creation fails.
    pub fn fail_display(&mut self, fail: bool) {
        self.fail_display = fail;
    }

    /// Report a negative index once capture reaches `frame`.
    pub fn fail_at_frame(&mut self, frame: Option<i64>) {
        self.fail_at_frame = frame;
    }

    /// Blocking waits time out once capture reaches `frame`.
    pub fn stall_at_frame(&mut self, frame: Option<i64>) {
        self.stall_at_frame = frame;
    }

    pub fn calls(&self) -> &[BoardCall] {
        &self.calls
    }

    pub fn clear_calls(&mut self) {
        self.calls.clear();
    }

    pub fn parameter(&self, field: BoardField) -> Option<i64> {
        self.parameters.get(&field).copied()
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn live_displays(&self) -> usize {
        self.displays.len()
    }

    pub fn is_acquiring(&self) -> bool {
        self.acquiring.is_some()
    }

    pub fn frames_drawn(&self) -> u64 {
        self.frames_drawn
    }

    fn next_handle(&mut self) -> u64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    fn advance(&mut self, buffer: BufferHandle, to: i64) -> i64 {
        let Some((active, target)) = self.acquiring else {
            return self.last_frame;
        };
        if active != buffer {
            return -1;
        }
        let mut next = to.max(self.last_frame);
        if let FrameTarget::Finite(n) = target {
            next = next.min(i64::try_from(n).unwrap_or(i64::MAX));
        }
        if let Some(fail) = self.fail_at_frame {
            if next >= fail {
                return -1;
            }
        }
        self.last_frame = next;
        next
    }
}

impl FrameGrabber for SimulatedGrabber {
    fn allocate_buffer(&mut self, size_bytes: u64, frames: u32) -> Result<BufferHandle> {
        self.calls.push(BoardCall::AllocateBuffer { size_bytes, frames });
        if self.fail_allocation || frames == 0 {
            return Err(CameraError::Resource(format!(
                "could not allocate {size_bytes} bytes for {frames} frames"
            )));
        }
        let handle = BufferHandle(self.next_handle());
        let frame_bytes = (size_bytes / u64::from(frames)) as usize;
        self.buffers.insert(
            handle,
            SimBuffer {
                frame_bytes,
                depth: frames,
                scratch: vec![0; frame_bytes],
            },
        );
        Ok(handle)
    }

    fn free_buffer(&mut self, buffer: BufferHandle) -> Result<()> {
        self.calls.push(BoardCall::FreeBuffer(buffer));
        self.buffers
            .remove(&buffer)
            .map(|_| ())
            .ok_or_else(|| CameraError::Board(format!("{buffer:?} is not allocated")))
    }

    fn create_display(&mut self, bit_depth: u8, width: u32, height: u32) -> Result<DisplayHandle> {
        self.calls.push(BoardCall::CreateDisplay {
            bit_depth,
            width,
            height,
        });
        if self.fail_display {
            return Err(CameraError::Resource(format!(
                "could not create {width}x{height} display"
            )));
        }
        let handle = DisplayHandle(self.next_handle());
        self.displays.push(handle);
        Ok(handle)
    }

    fn close_display(&mut self, display: DisplayHandle) -> Result<()> {
        self.calls.push(BoardCall::CloseDisplay(display));
        let before = self.displays.len();
        self.displays.retain(|d| *d != display);
        if self.displays.len() == before {
            return Err(CameraError::Board(format!("{display:?} is not open")));
        }
        Ok(())
    }

    fn set_parameter(&mut self, field: BoardField, value: i64) -> Result<()> {
        self.calls.push(BoardCall::SetParameter(field, value));
        self.parameters.insert(field, value);
        Ok(())
    }

    fn acquire_start(&mut self, buffer: BufferHandle, target: FrameTarget) -> Result<()> {
        self.calls.push(BoardCall::AcquireStart(buffer, target));
        if !self.buffers.contains_key(&buffer) {
            return Err(CameraError::Board(format!("{buffer:?} is not allocated")));
        }
        self.acquiring = Some((buffer, target));
        self.last_frame = 0;
        Ok(())
    }

    fn acquire_stop(&mut self) -> Result<()> {
        self.calls.push(BoardCall::AcquireStop);
        self.acquiring = None;
        Ok(())
    }

    fn last_frame_index(&mut self, buffer: BufferHandle) -> i64 {
        let to = self.last_frame + self.frames_per_poll;
        self.advance(buffer, to)
    }

    fn wait_frame_index(&mut self, buffer: BufferHandle, frame: i64, _timeout: Duration) -> i64 {
        if self.acquiring.is_none() {
            return FRAME_WAIT_TIMEOUT;
        }
        if let Some(stall) = self.stall_at_frame {
            if frame >= stall {
                return FRAME_WAIT_TIMEOUT;
            }
        }
        let to = frame.max(self.last_frame + self.frames_per_poll);
        self.advance(buffer, to)
    }

    fn frame(&mut self, buffer: BufferHandle, index: i64) -> Result<&[u8]> {
        let last = self.last_frame;
        let sim = self
            .buffers
            .get_mut(&buffer)
            .ok_or_else(|| CameraError::Board(format!("{buffer:?} is not allocated")))?;
        let oldest = last - i64::from(sim.depth) + 1;
        if index < 1 || index > last || index < oldest {
            return Err(CameraError::Board(format!(
                "frame {index} not held in buffer (last {last}, depth {})",
                sim.depth
            )));
        }
        for (i, px) in sim.scratch.iter_mut().enumerate() {
            *px = (i as i64 + index) as u8;
        }
        Ok(&sim.scratch[..sim.frame_bytes])
    }

    fn draw_frame(&mut self, display: DisplayHandle, buffer: BufferHandle, index: i64) -> Result<()> {
        if !self.displays.contains(&display) {
            return Err(CameraError::Board(format!("{display:?} is not open")));
        }
        self.frame(buffer, index)?;
        self.frames_drawn += 1;
        Ok(())
    }
}

/// Simulated serial updater. Reads the command file like the real one,
/// answers identification and queries, and prints the error marker for
/// commands it has been told to refuse.
pub struct SimulatedUpdater {
    serial: String,
    batches: Vec<Vec<String>>,
    reject_prefixes: Vec<String>,
    queries: HashMap<String, i64>,
}

impl Default for SimulatedUpdater {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedUpdater {
    pub fn new() -> Self {
        Self {
            serial: "600213".to_string(),
            batches: Vec::new(),
            reject_prefixes: Vec::new(),
            queries: HashMap::new(),
        }
    }

    /// Refuse every command line starting with `prefix`, e.g. `#R`.
    pub fn reject_commands_starting_with(&mut self, prefix: &str) {
        self.reject_prefixes.push(prefix.to_string());
    }

    pub fn accept_all(&mut self) {
        self.reject_prefixes.clear();
    }

    /// Answer the bare query `code` with `value`.
    pub fn answer_query(&mut self, code: &str, value: i64) {
        self.queries.insert(code.to_string(), value);
    }

    /// Command lines of every batch received, sentinels stripped.
    pub fn batches(&self) -> &[Vec<String>] {
        &self.batches
    }
}

impl Updater for SimulatedUpdater {
    fn run(&mut self, command_file: &Path) -> Result<Vec<String>> {
        let contents = fs::read_to_string(command_file)?;
        let lines: Vec<&str> = contents.lines().collect();
        let (Some(&first), Some(&last)) = (lines.first(), lines.last()) else {
            return Ok(vec!["!E empty command file".to_string()]);
        };
        if first != IDENTIFY_COMMAND || last != QUIT_SENTINEL {
            return Ok(vec!["!E missing sentinel".to_string()]);
        }
        let commands: Vec<String> = lines[1..lines.len() - 1]
            .iter()
            .map(|l| l.to_string())
            .collect();
        let mut responses = vec![format!("#N({})", self.serial)];
        for command in &commands {
            if self.reject_prefixes.iter().any(|p| command.starts_with(p)) {
                responses.push(format!("!E {command}"));
            } else if let Some(v) = self.queries.get(command) {
                responses.push(format!("{command}({v})"));
            } else {
                responses.push("OK".to_string());
            }
        }
        self.batches.push(commands);
        Ok(responses)
    }
}
