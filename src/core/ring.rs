//! Purpose: Self-rotating compressed log sink over a bounded set of files in one directory.
//! Exports: `Ring`, `RingOptions`, `RingStats`, buffering and sizing constants.
//! Role: Owns the buffered write path and decides when to cut over; delegates naming to `allocate`.
//! Invariants: At most one rotation file is open for writing; it is finalized before being released.
//! Invariants: Bytes reach the encoder in the order `write` calls acquired the state lock.
//! Invariants: The per-file cap is approximate; size is sampled, not enforced per byte.
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;

#[cfg(unix)]
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::core::allocate::{self, next_file_name, rotation_index, snapshot_dir};
use crate::core::codec::{Codec, CountingFile, ZstdCodec};
use crate::core::error::{Error, ErrorKind};

/// Writes up to this size are accumulated in memory.
pub const BUFFER_UNIT: usize = 64 * 1024;
/// The buffer is pushed into the encoder once it grows past this length.
pub const FLUSH_THRESHOLD: usize = 65535;
/// `max_total_size` must be strictly larger than this.
pub const MIN_TOTAL_SIZE: u64 = 1024 * 1024;
pub const MIN_FILES: u32 = 2;
pub const DEFAULT_DIRECTORY_MODE: u32 = 0o755;
pub const DEFAULT_FILE_MODE: u32 = 0o644;

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RingOptions {
    pub max_total_size: u64,
    #[serde(default = "default_files")]
    pub files: u32,
    #[serde(default = "default_directory_mode")]
    pub directory_mode: u32,
    #[serde(default = "default_file_mode")]
    pub file_mode: u32,
}

fn default_files() -> u32 {
    MIN_FILES
}

fn default_directory_mode() -> u32 {
    DEFAULT_DIRECTORY_MODE
}

fn default_file_mode() -> u32 {
    DEFAULT_FILE_MODE
}

impl RingOptions {
    pub fn new(max_total_size: u64) -> Self {
        Self {
            max_total_size,
            files: MIN_FILES,
            directory_mode: DEFAULT_DIRECTORY_MODE,
            file_mode: DEFAULT_FILE_MODE,
        }
    }

    pub fn files(mut self, files: u32) -> Self {
        self.files = files;
        self
    }

    pub fn directory_mode(mut self, mode: u32) -> Self {
        self.directory_mode = mode;
        self
    }

    pub fn file_mode(mut self, mode: u32) -> Self {
        self.file_mode = mode;
        self
    }

    /// Applies the coercions: fewer than two files means two, a zero mode means the default.
    fn normalized(mut self) -> Self {
        if self.files < MIN_FILES {
            self.files = MIN_FILES;
        }
        if self.directory_mode == 0 {
            self.directory_mode = DEFAULT_DIRECTORY_MODE;
        }
        if self.file_mode == 0 {
            self.file_mode = DEFAULT_FILE_MODE;
        }
        self
    }

    fn validate(&self) -> Result<(), Error> {
        if self.max_total_size <= MIN_TOTAL_SIZE {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("max_total_size must be bigger than 1 MiB")
                .with_hint("Use at least 1 MiB + 1 byte (e.g. 2M)."));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RingStats {
    pub active_path: Option<PathBuf>,
    /// Uncompressed bytes accepted since the last rotation.
    pub bytes_since_rotation: u64,
    /// Bytes accepted since the on-disk size was last sampled.
    pub bytes_since_check: u64,
    /// Bytes the encoder has handed to the active file so far.
    pub compressed_bytes: u64,
    /// Bytes accepted but still held in memory.
    pub buffered: usize,
    pub rotations: u64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum RotateReason {
    Requested,
    SizeCap,
}

struct Active<E> {
    path: PathBuf,
    index: u32,
    encoder: E,
}

struct RingState<E> {
    buf: Vec<u8>,
    active: Option<Active<E>>,
    bytes_since_rotation: u64,
    bytes_since_check: u64,
    rotations: u64,
    closed: bool,
}

pub struct Ring<C: Codec = ZstdCodec> {
    dir: PathBuf,
    prefix: String,
    codec: C,
    files: u32,
    file_cap: u64,
    file_mode: u32,
    state: Mutex<RingState<C::Encoder>>,
}

impl Ring<ZstdCodec> {
    /// Opens a zstd-compressed ring in `dir`, creating the directory if needed.
    pub fn open(
        dir: impl AsRef<Path>,
        prefix: impl Into<String>,
        options: RingOptions,
    ) -> Result<Self, Error> {
        Self::with_codec(dir, prefix, options, ZstdCodec::default())
    }
}

impl<C: Codec> Ring<C> {
    pub fn with_codec(
        dir: impl AsRef<Path>,
        prefix: impl Into<String>,
        options: RingOptions,
        codec: C,
    ) -> Result<Self, Error> {
        let dir = dir.as_ref().to_path_buf();
        let prefix = prefix.into();
        let options = options.normalized();
        options.validate()?;
        if dir.as_os_str().is_empty() {
            return Err(Error::new(ErrorKind::Usage).with_message("directory must not be empty"));
        }
        allocate::validate_prefix(&prefix)?;
        prepare_dir(&dir, options.directory_mode)?;

        let mut ring = Self {
            dir,
            prefix,
            codec,
            files: options.files,
            file_cap: options.max_total_size / u64::from(options.files),
            file_mode: options.file_mode,
            state: Mutex::new(RingState {
                buf: Vec::with_capacity(BUFFER_UNIT),
                active: None,
                bytes_since_rotation: 0,
                bytes_since_check: 0,
                rotations: 0,
                closed: false,
            }),
        };
        let active = ring.open_next(None)?;
        info!(
            dir = %ring.dir.display(),
            prefix = %ring.prefix,
            files = ring.files,
            file_cap = ring.file_cap,
            path = %active.path.display(),
            "opened log ring"
        );
        ring.state_mut().active = Some(active);
        Ok(ring)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn suffix(&self) -> &str {
        self.codec.suffix()
    }

    pub fn files(&self) -> u32 {
        self.files
    }

    pub fn per_file_cap(&self) -> u64 {
        self.file_cap
    }

    /// Runs the allocator against the live directory without opening anything.
    pub fn next_file_name(&self) -> Result<String, Error> {
        let entries = snapshot_dir(&self.dir)?;
        Ok(next_file_name(
            &entries,
            &self.prefix,
            self.codec.suffix(),
            self.files,
        ))
    }

    /// `None` after a failed rotation, until a later `rotate` succeeds.
    pub fn active_path(&self) -> Result<Option<PathBuf>, Error> {
        let state = self.lock_state()?;
        Ok(state.active.as_ref().map(|active| active.path.clone()))
    }

    pub fn stats(&self) -> Result<RingStats, Error> {
        let state = self.lock_state()?;
        let active = state.active.as_ref();
        Ok(RingStats {
            active_path: active.map(|active| active.path.clone()),
            bytes_since_rotation: state.bytes_since_rotation,
            bytes_since_check: state.bytes_since_check,
            compressed_bytes: active
                .map(|active| self.codec.sink(&active.encoder).written())
                .unwrap_or(0),
            buffered: state.buf.len(),
            rotations: state.rotations,
        })
    }

    /// Accepts `data` into the ring and returns its length.
    ///
    /// Small writes are buffered and only reach the encoder once the buffer
    /// passes [`FLUSH_THRESHOLD`]; writes larger than [`BUFFER_UNIT`] flush the
    /// pending buffer and go straight to the encoder. Every time the bytes
    /// accepted since the last check exceed the per-file cap, the active
    /// file's real size is read and the ring rotates if it is over the cap.
    pub fn write(&self, data: &[u8]) -> Result<usize, Error> {
        let mut guard = self.lock_state()?;
        let state = &mut *guard;
        ensure_open(state)?;

        let len = data.len() as u64;
        state.bytes_since_check += len;
        if state.bytes_since_check > self.file_cap {
            self.check_for_rotate(state)?;
        }

        let Some(active) = state.active.as_mut() else {
            return Err(no_active_file());
        };
        if data.len() <= BUFFER_UNIT {
            let pending = state.buf.len();
            state.buf.extend_from_slice(data);
            if state.buf.len() > FLUSH_THRESHOLD {
                if let Err(err) = drain(&mut state.buf, active) {
                    // An error means none of `data` was accepted.
                    state.buf.truncate(pending);
                    return Err(err);
                }
            }
        } else {
            drain(&mut state.buf, active)?;
            active
                .encoder
                .write_all(data)
                .map_err(|err| stream_error(err, active))?;
        }
        state.bytes_since_rotation += len;
        Ok(data.len())
    }

    /// Finalizes the active file and cuts over to the file the allocator picks.
    ///
    /// If the next file cannot be opened the ring is left without an active
    /// file; writes fail until a later `rotate` succeeds.
    pub fn rotate(&self) -> Result<(), Error> {
        let mut guard = self.lock_state()?;
        let state = &mut *guard;
        ensure_open(state)?;
        self.rotate_locked(state, RotateReason::Requested)
    }

    /// Pushes buffered bytes through the encoder and flushes it to the file.
    pub fn flush(&self) -> Result<(), Error> {
        let mut guard = self.lock_state()?;
        let state = &mut *guard;
        ensure_open(state)?;
        let Some(active) = state.active.as_mut() else {
            return Err(no_active_file());
        };
        drain(&mut state.buf, active)?;
        active
            .encoder
            .flush()
            .map_err(|err| stream_error(err, active))
    }

    /// Flushes the buffer, finalizes the compressed stream, and closes the file.
    /// A second call returns `ErrorKind::Closed`.
    pub fn close(&self) -> Result<(), Error> {
        let mut guard = self.lock_state()?;
        close_state(&self.codec, &mut guard)
    }

    fn check_for_rotate(&self, state: &mut RingState<C::Encoder>) -> Result<(), Error> {
        let Some(active) = state.active.as_ref() else {
            return Err(no_active_file());
        };
        let size = self
            .codec
            .sink(&active.encoder)
            .file()
            .metadata()
            .map_err(|err| {
                Error::io(err)
                    .with_message("could not stat active file")
                    .with_path(&active.path)
                    .with_index(active.index)
            })?
            .len();
        state.bytes_since_check = 0;
        debug!(path = %active.path.display(), size, cap = self.file_cap, "size check");
        if size > self.file_cap {
            self.rotate_locked(state, RotateReason::SizeCap)?;
        }
        Ok(())
    }

    fn rotate_locked(
        &self,
        state: &mut RingState<C::Encoder>,
        reason: RotateReason,
    ) -> Result<(), Error> {
        let mut retired = None;
        if let Some(mut active) = state.active.take() {
            if let Err(err) = drain(&mut state.buf, &mut active) {
                state.active = Some(active);
                return Err(err);
            }
            let path = active.path;
            let index = active.index;
            let sink = self
                .codec
                .finish(active.encoder)
                .map_err(|err| err.with_path(&path).with_index(index))?;
            retired = Some((sink, path));
        }

        let next = self.open_next(retired.as_ref().map(|(_, path)| path.as_path()));
        // The outgoing handle is closed only once the next file is ready.
        let retired_path = retired.map(|(sink, path)| {
            drop(sink.into_inner());
            path
        });
        let next = next?;

        info!(
            from = ?retired_path,
            to = %next.path.display(),
            index = next.index,
            reason = ?reason,
            bytes = state.bytes_since_rotation,
            "rotated log ring"
        );
        state.active = Some(next);
        state.bytes_since_rotation = 0;
        state.bytes_since_check = 0;
        state.rotations += 1;
        Ok(())
    }

    /// Allocates, creates, and binds an encoder to the next rotation file.
    /// `retired` is the file just finalized; it counts as the newest member
    /// even when the file system's timestamp granularity ties it with others.
    fn open_next(&self, retired: Option<&Path>) -> Result<Active<C::Encoder>, Error> {
        let suffix = self.codec.suffix();
        let mut entries = snapshot_dir(&self.dir)?;
        if let Some(retired) = retired.and_then(Path::file_name).and_then(|name| name.to_str()) {
            let now = SystemTime::now();
            for entry in entries.iter_mut().filter(|entry| entry.name == retired) {
                entry.modified = entry.modified.max(now);
            }
        }
        let name = next_file_name(&entries, &self.prefix, suffix, self.files);
        let index = rotation_index(&name, &self.prefix, suffix).unwrap_or_default();
        let path = self.dir.join(&name);

        let mut open = OpenOptions::new();
        open.create(true).truncate(true).write(true);
        #[cfg(unix)]
        open.mode(self.file_mode);
        let file = open.open(&path).map_err(|err| {
            Error::io(err)
                .with_message("could not open rotation file")
                .with_path(&path)
                .with_index(index)
        })?;

        let encoder = self
            .codec
            .encoder(CountingFile::new(file))
            .map_err(|err| err.with_path(&path).with_index(index))?;
        Ok(Active {
            path,
            index,
            encoder,
        })
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, RingState<C::Encoder>>, Error> {
        self.state
            .lock()
            .map_err(|_| Error::new(ErrorKind::Internal).with_message("ring state lock poisoned"))
    }

    fn state_mut(&mut self) -> &mut RingState<C::Encoder> {
        match self.state.get_mut() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<C: Codec> Drop for Ring<C> {
    fn drop(&mut self) {
        let state = match self.state.get_mut() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if state.closed {
            return;
        }
        if let Err(err) = close_state(&self.codec, state) {
            warn!(
                dir = %self.dir.display(),
                prefix = %self.prefix,
                error = %err,
                "log ring not finalized on drop"
            );
        }
    }
}

impl<C: Codec> Write for &Ring<C> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ring::<C>::write(self, buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ring::<C>::flush(self).map_err(io::Error::from)
    }
}

impl<C: Codec> Write for Ring<C> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ring::<C>::write(self, buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ring::<C>::flush(self).map_err(io::Error::from)
    }
}

fn prepare_dir(dir: &Path, mode: u32) -> Result<(), Error> {
    if !dir.is_dir() {
        let mut builder = fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        builder.mode(mode);
        #[cfg(not(unix))]
        let _ = mode;
        builder.create(dir).map_err(|err| {
            Error::io(err)
                .with_message("could not create directory")
                .with_path(dir)
        })?;
    }
    fs::read_dir(dir).map_err(|err| {
        Error::io(err)
            .with_message("could not read directory")
            .with_path(dir)
    })?;
    Ok(())
}

fn close_state<C: Codec>(codec: &C, state: &mut RingState<C::Encoder>) -> Result<(), Error> {
    ensure_open(state)?;
    state.closed = true;
    let Some(mut active) = state.active.take() else {
        if state.buf.is_empty() {
            return Ok(());
        }
        let lost = state.buf.len();
        state.buf.clear();
        return Err(no_active_file()
            .with_message(format!("{lost} buffered bytes dropped: no active file")));
    };
    drain(&mut state.buf, &mut active)?;
    let sink = codec
        .finish(active.encoder)
        .map_err(|err| err.with_path(&active.path).with_index(active.index))?;
    drop(sink.into_inner());
    debug!(path = %active.path.display(), "closed log ring");
    Ok(())
}

fn ensure_open<E>(state: &RingState<E>) -> Result<(), Error> {
    if state.closed {
        return Err(Error::new(ErrorKind::Closed).with_message("ring is closed"));
    }
    Ok(())
}

fn drain<E: Write>(buf: &mut Vec<u8>, active: &mut Active<E>) -> Result<(), Error> {
    if buf.is_empty() {
        return Ok(());
    }
    active
        .encoder
        .write_all(buf)
        .map_err(|err| stream_error(err, active))?;
    buf.clear();
    Ok(())
}

fn stream_error<E>(err: io::Error, active: &Active<E>) -> Error {
    Error::io(err)
        .with_message("could not write to compression stream")
        .with_path(&active.path)
        .with_index(active.index)
}

fn no_active_file() -> Error {
    Error::new(ErrorKind::Io)
        .with_message("no active rotation file")
        .with_hint("A previous rotation failed; call rotate() again or reopen the ring.")
}
