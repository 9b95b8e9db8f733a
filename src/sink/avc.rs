//! AVC text sink: the HP93000 ASCII vector format writer and reader.
//!
//! Grammar (one statement per line): `empty_line`, `port_stmt`, `format_stmt`,
//! `normal_vec`, `loop_begin`/`loop_end`, `match_loop_begin`/
//! `match_loop_idle_begin`/`match_loop_end`. The reader is an explicit state
//! machine over a stack of in-progress frames (loop body / matched-loop
//! condition / matched-loop idle side) rather than mutual recursion through
//! a generator, so memory stays bounded by nesting depth, not call depth.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use super::{SinkError, VectorSink};
use crate::vector::{LoopVector, MatchedLoopVector, NormalVector, PinDecl, Vector, VectorBuilder};

/// Ascii vector writer for the HP93000 tester: the `.avc` stimuli file plus
/// its companion `.wtb`/`.tmf` files, all sharing the stimuli file's stem.
pub struct AvcSink {
    stimuli_path: PathBuf,
    wtb_path: PathBuf,
    tmf_path: PathBuf,
    port: Option<String>,
    device_cycle_name: String,
    wtb_name: String,
    // (logical_name, physical_name), sorted alphabetically by logical name.
    pin_order: Vec<(String, String)>,
    writer: Option<BufWriter<File>>,
}

impl AvcSink {
    pub fn new(
        stimuli_path: impl AsRef<Path>,
        pins: &BTreeMap<String, PinDecl>,
        port: Option<String>,
        device_cycle_name: impl Into<String>,
        wtb_name: impl Into<String>,
    ) -> Self {
        let stimuli_path = stimuli_path.as_ref().to_path_buf();
        let wtb_path = stimuli_path.with_extension("wtb");
        let tmf_path = stimuli_path.with_extension("tmf");
        let pin_order = pins
            .iter()
            .map(|(logical, decl)| (logical.clone(), decl.physical_name.clone()))
            .collect();
        Self {
            stimuli_path,
            wtb_path,
            tmf_path,
            port,
            device_cycle_name: device_cycle_name.into(),
            wtb_name: wtb_name.into(),
            pin_order,
            writer: None,
        }
    }

    fn io_err(action: &str, path: &Path, cause: std::io::Error) -> SinkError {
        SinkError::Io {
            action: action.to_string(),
            path: path.display().to_string(),
            cause,
        }
    }

    fn write_one(&mut self, vector: &Vector) -> Result<(), SinkError> {
        match vector {
            Vector::Normal(n) => self.write_normal(n),
            Vector::Loop(l) => self.write_loop(l),
            Vector::MatchedLoop(m) => self.write_matched_loop(m),
        }
    }

    fn writer_mut(&mut self) -> Result<&mut BufWriter<File>, SinkError> {
        self.writer
            .as_mut()
            .ok_or_else(|| Self::io_err("write", &self.stimuli_path.clone(), not_open_error()))
    }

    fn write_normal(&mut self, n: &NormalVector) -> Result<(), SinkError> {
        let pin_chars: String = self
            .pin_order
            .iter()
            .map(|(logical, _)| n.pin_state.get(logical).copied().unwrap_or('X'))
            .collect();
        let mut line = format!("R{} {} {} ", n.repeat, self.device_cycle_name, pin_chars);
        if let Some(comment) = &n.comment {
            if !comment.is_empty() {
                line.push_str("[%] ");
                line.push_str(comment);
                line.push(' ');
            }
        }
        line.push_str(";\n");
        let path = self.stimuli_path.clone();
        self.writer_mut()?
            .write_all(line.as_bytes())
            .map_err(|e| Self::io_err("write", &path, e))
    }

    fn write_loop(&mut self, l: &LoopVector) -> Result<(), SinkError> {
        let path = self.stimuli_path.clone();
        self.writer_mut()?
            .write_all(format!("SQPG LBGN {} ;\n", l.repeat).as_bytes())
            .map_err(|e| Self::io_err("write", &path, e))?;
        for v in &l.body {
            self.write_one(v)?;
        }
        self.writer_mut()?
            .write_all(b"SQPG LEND ;\n")
            .map_err(|e| Self::io_err("write", &path, e))
    }

    fn write_matched_loop(&mut self, m: &MatchedLoopVector) -> Result<(), SinkError> {
        let path = self.stimuli_path.clone();
        self.writer_mut()?
            .write_all(format!("SQPG MACT {} ;\n", m.retries).as_bytes())
            .map_err(|e| Self::io_err("write", &path, e))?;
        for v in &m.condition {
            self.write_normal(v)?;
        }
        self.writer_mut()?
            .write_all(format!("SQPG MRPT {} ;\n", m.idle.len()).as_bytes())
            .map_err(|e| Self::io_err("write", &path, e))?;
        for v in &m.idle {
            self.write_normal(v)?;
        }
        self.writer_mut()?
            .write_all(b"SQPG PADDING ;\n")
            .map_err(|e| Self::io_err("write", &path, e))
    }
}

fn not_open_error() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, "sink was not opened before writing")
}

impl VectorSink for AvcSink {
    fn open(&mut self) -> Result<(), SinkError> {
        std::fs::write(&self.wtb_path, &self.wtb_name)
            .map_err(|e| Self::io_err("write", &self.wtb_path.clone(), e))?;
        let tmf_body = format!(
            "PINS {}\nDDC {}\n0 0\n1 1\nX 2\nL 3\nH 4\nZ 5",
            self.port.as_deref().unwrap_or(""),
            self.device_cycle_name,
        );
        std::fs::write(&self.tmf_path, tmf_body)
            .map_err(|e| Self::io_err("write", &self.tmf_path.clone(), e))?;

        let file = File::create(&self.stimuli_path)
            .map_err(|e| Self::io_err("create", &self.stimuli_path.clone(), e))?;
        let mut writer = BufWriter::new(file);
        if let Some(port) = &self.port {
            writer
                .write_all(format!("PORT {port} ;\n").as_bytes())
                .map_err(|e| Self::io_err("write", &self.stimuli_path.clone(), e))?;
        }
        let format_line = format!(
            "FORMAT {} ;\n",
            self.pin_order
                .iter()
                .map(|(_, physical)| physical.as_str())
                .collect::<Vec<_>>()
                .join(" ")
        );
        writer
            .write_all(format_line.as_bytes())
            .map_err(|e| Self::io_err("write", &self.stimuli_path.clone(), e))?;
        self.writer = Some(writer);
        Ok(())
    }

    fn write_vectors(&mut self, vectors: &[Vector], compress: bool) -> Result<(), SinkError> {
        let owned;
        let vectors: &[Vector] = if compress {
            owned = VectorBuilder::compress(vectors.to_vec());
            &owned
        } else {
            vectors
        };
        for v in vectors {
            self.write_one(v)?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        if let Some(mut writer) = self.writer.take() {
            writer
                .flush()
                .map_err(|e| Self::io_err("flush", &self.stimuli_path.clone(), e))?;
        }
        Ok(())
    }
}

/// One in-progress collection while reading an AVC file: the top level, a
/// `LBGN`/`LEND` loop body, or one side of a `MACT`/`MRPT`/`PADDING`
/// matched loop.
enum Frame {
    Root(Vec<Vector>),
    Loop {
        repeat: u32,
        body: Vec<Vector>,
    },
    MatchedCond {
        retries: u32,
        condition: Vec<NormalVector>,
    },
    MatchedIdle {
        retries: u32,
        condition: Vec<NormalVector>,
        idle: Vec<NormalVector>,
    },
}

/// Streaming AVC parser. Reconstructs loops and matched loops with an
/// explicit frame stack instead of mutual recursion.
pub struct AvcReader {
    path: PathBuf,
    physical_to_logical: BTreeMap<String, String>,
    device_cycle_name: Option<String>,
}

impl AvcReader {
    pub fn new(path: impl AsRef<Path>, pins: &BTreeMap<String, PinDecl>) -> Self {
        let physical_to_logical = pins
            .iter()
            .map(|(logical, decl)| (decl.physical_name.clone(), logical.clone()))
            .collect();
        Self {
            path: path.as_ref().to_path_buf(),
            physical_to_logical,
            device_cycle_name: None,
        }
    }

    /// Parse the whole file into a flat top-level vector stream.
    pub fn read_all(&mut self) -> Result<Vec<Vector>, SinkError> {
        let file = File::open(&self.path).map_err(|e| SinkError::Io {
            action: "open".to_string(),
            path: self.path.display().to_string(),
            cause: e,
        })?;
        let reader = BufReader::new(file);

        let mut format_pins: Vec<String> = Vec::new();
        let mut stack: Vec<Frame> = vec![Frame::Root(Vec::new())];

        for (idx, line) in reader.lines().enumerate() {
            let line_no = idx + 1;
            let line = line.map_err(|e| SinkError::Io {
                action: "read".to_string(),
                path: self.path.display().to_string(),
                cause: e,
            })?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue; // empty_line
            }
            let stmt = trimmed
                .strip_suffix(';')
                .map(str::trim)
                .ok_or_else(|| self.err(line_no, "statement must end with ';'"))?;

            if let Some(rest) = stmt.strip_prefix("PORT ") {
                let _ = rest.trim(); // port name: not needed to reconstruct vectors
                continue;
            }
            if let Some(rest) = stmt.strip_prefix("FORMAT ") {
                format_pins = rest.split_whitespace().map(str::to_string).collect();
                continue;
            }
            if let Some(rest) = stmt.strip_prefix("SQPG ") {
                self.handle_sequencer_stmt(rest, line_no, &mut stack)?;
                continue;
            }
            if let Some(rest) = stmt.strip_prefix('R') {
                let normal = self.parse_normal_vec(rest, line_no, &format_pins)?;
                self.push_normal(&mut stack, normal, line_no)?;
                continue;
            }
            return Err(self.err(line_no, format!("unrecognized statement {stmt:?}")));
        }

        match stack.pop() {
            Some(Frame::Root(vectors)) if stack.is_empty() => Ok(vectors),
            _ => Err(self.err(usize::MAX, "unterminated loop or matched loop at end of file")),
        }
    }

    fn handle_sequencer_stmt(
        &self,
        rest: &str,
        line_no: usize,
        stack: &mut Vec<Frame>,
    ) -> Result<(), SinkError> {
        let mut parts = rest.split_whitespace();
        let keyword = parts
            .next()
            .ok_or_else(|| self.err(line_no, "empty SQPG statement"))?;
        match keyword {
            "LBGN" => {
                let repeat: u32 = parts
                    .next()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| self.err(line_no, "LBGN missing repeat count"))?;
                stack.push(Frame::Loop {
                    repeat,
                    body: Vec::new(),
                });
                Ok(())
            }
            "LEND" => match stack.pop() {
                Some(Frame::Loop { repeat, body }) => {
                    self.push_vector(stack, Vector::Loop(LoopVector { body, repeat }), line_no)
                }
                _ => Err(self.err(line_no, "LEND without matching LBGN")),
            },
            "MACT" => {
                let retries: u32 = parts
                    .next()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| self.err(line_no, "MACT missing retry count"))?;
                stack.push(Frame::MatchedCond {
                    retries,
                    condition: Vec::new(),
                });
                Ok(())
            }
            "MRPT" => match stack.pop() {
                Some(Frame::MatchedCond { retries, condition }) => {
                    stack.push(Frame::MatchedIdle {
                        retries,
                        condition,
                        idle: Vec::new(),
                    });
                    Ok(())
                }
                _ => Err(self.err(line_no, "MRPT without matching MACT")),
            },
            "PADDING" => match stack.pop() {
                Some(Frame::MatchedIdle {
                    retries,
                    condition,
                    idle,
                }) => self.push_vector(
                    stack,
                    Vector::MatchedLoop(MatchedLoopVector {
                        condition,
                        idle,
                        retries,
                    }),
                    line_no,
                ),
                _ => Err(self.err(line_no, "PADDING without matching MRPT")),
            },
            other => Err(self.err(line_no, format!("unknown SQPG keyword {other:?}"))),
        }
    }

    fn push_vector(
        &self,
        stack: &mut Vec<Frame>,
        vector: Vector,
        line_no: usize,
    ) -> Result<(), SinkError> {
        match stack.last_mut() {
            Some(Frame::Root(vectors)) => vectors.push(vector),
            Some(Frame::Loop { body, .. }) => body.push(vector),
            _ => return Err(self.err(line_no, "vector closed outside a loop or root context")),
        }
        Ok(())
    }

    fn push_normal(
        &self,
        stack: &mut Vec<Frame>,
        normal: NormalVector,
        line_no: usize,
    ) -> Result<(), SinkError> {
        match stack.last_mut() {
            Some(Frame::Root(vectors)) => vectors.push(Vector::Normal(normal)),
            Some(Frame::Loop { body, .. }) => body.push(Vector::Normal(normal)),
            Some(Frame::MatchedCond { condition, .. }) => condition.push(normal),
            Some(Frame::MatchedIdle { idle, .. }) => idle.push(normal),
            None => return Err(self.err(line_no, "normal vector with no open frame")),
        }
        Ok(())
    }

    fn parse_normal_vec(
        &mut self,
        rest: &str,
        line_no: usize,
        format_pins: &[String],
    ) -> Result<NormalVector, SinkError> {
        // rest == "<repeat> <device_cycle_name> <pin_chars> [%] <comment>"
        let mut tokens = rest.splitn(3, ' ');
        let repeat: u32 = tokens
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| self.err(line_no, "missing or invalid repeat count"))?;
        let device_cycle_name = tokens
            .next()
            .ok_or_else(|| self.err(line_no, "missing device cycle name"))?
            .to_string();
        if self.device_cycle_name.is_none() {
            self.device_cycle_name = Some(device_cycle_name);
        }
        let remainder = tokens.next().unwrap_or("").trim();
        let (pin_chars, comment) = match remainder.find("[%]") {
            Some(pos) => (
                remainder[..pos].trim(),
                Some(remainder[pos + 3..].trim().to_string()),
            ),
            None => (remainder, None),
        };
        if format_pins.is_empty() {
            return Err(self.err(line_no, "normal vector before FORMAT statement"));
        }
        if pin_chars.chars().count() != format_pins.len() {
            return Err(self.err(
                line_no,
                format!(
                    "pin state has {} characters, expected {}",
                    pin_chars.chars().count(),
                    format_pins.len()
                ),
            ));
        }
        let mut pin_state = BTreeMap::new();
        for (physical, ch) in format_pins.iter().zip(pin_chars.chars()) {
            let logical = self
                .physical_to_logical
                .get(physical)
                .cloned()
                .unwrap_or_else(|| physical.clone());
            pin_state.insert(logical, ch);
        }
        Ok(NormalVector {
            pin_state,
            repeat,
            comment,
        })
    }

    fn err(&self, line: usize, reason: impl Into<String>) -> SinkError {
        SinkError::ParseError {
            line,
            reason: reason.into(),
        }
    }
}
