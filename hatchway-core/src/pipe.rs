//! A pipe owns a local byte endpoint: a spawned child's stdio, a UNIX
//! stream socket, or a pty. It emits read events, accepts buffered writes
//! and reports how the endpoint went away, including the child's wait
//! status.

use std::io::{Read, Write};
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;

use bytes::Bytes;
use hatchway_common::Problem;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tracing::{debug, warn};

#[derive(Debug)]
pub enum PipeEvent {
    Data(Bytes),
    /// The read side hit end of data; emitted at most once.
    Eof,
    /// Terminal. `exit` is present when the pipe owned a child process.
    Closed {
        problem: Option<Problem>,
        exit: Option<ExitStatusInfo>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatusInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

/// Symbolic name of a termination signal, without the SIG prefix.
pub fn signal_name(signal: i32) -> String {
    match signal {
        1 => "HUP".to_owned(),
        2 => "INT".to_owned(),
        3 => "QUIT".to_owned(),
        4 => "ILL".to_owned(),
        6 => "ABRT".to_owned(),
        8 => "FPE".to_owned(),
        9 => "KILL".to_owned(),
        10 => "USR1".to_owned(),
        11 => "SEGV".to_owned(),
        12 => "USR2".to_owned(),
        13 => "PIPE".to_owned(),
        14 => "ALRM".to_owned(),
        15 => "TERM".to_owned(),
        other => other.to_string(),
    }
}

#[derive(Debug)]
enum PipeOp {
    Write(Bytes),
    ShutdownWrite,
    Close(Option<Problem>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StderrMode {
    /// Route child stderr lines into the gateway log.
    Log,
    /// Merge child stderr into the data stream.
    Merge,
}

pub struct Pipe {
    ops_tx: UnboundedSender<PipeOp>,
    events_rx: UnboundedReceiver<PipeEvent>,
    pressure_tx: watch::Sender<bool>,
}

impl Pipe {
    pub fn write(&self, data: Bytes) {
        let _ = self.ops_tx.send(PipeOp::Write(data));
    }

    /// Flow pressure: while on, the pipe stops reading so the endpoint
    /// is throttled through the kernel buffer.
    pub fn set_pressure(&self, on: bool) {
        let _ = self.pressure_tx.send(on);
    }

    /// Half-close: no further writes, the peer sees end of input.
    pub fn shutdown_write(&self) {
        let _ = self.ops_tx.send(PipeOp::ShutdownWrite);
    }

    /// Schedule graceful shutdown; a `Closed` event follows once the
    /// endpoint has wound down.
    pub fn close(&self, problem: Option<Problem>) {
        let _ = self.ops_tx.send(PipeOp::Close(problem));
    }

    pub async fn next_event(&mut self) -> Option<PipeEvent> {
        self.events_rx.recv().await
    }

    /// Spawn `argv` with stdin/stdout bound to the pipe.
    pub fn spawn(
        argv: &[String],
        environ: &[String],
        directory: Option<&str>,
        stderr_mode: StderrMode,
    ) -> std::io::Result<Self> {
        let Some(program) = argv.first() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty argv",
            ));
        };

        let mut command = tokio::process::Command::new(program);
        command
            .args(&argv[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for entry in environ {
            if let Some((key, value)) = entry.split_once('=') {
                command.env(key, value);
            }
        }
        if let Some(directory) = directory {
            command.current_dir(directory);
        }

        let mut child = command.spawn()?;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (ops_tx, ops_rx) = unbounded_channel();
        let (events_tx, events_rx) = unbounded_channel();
        let (pressure_tx, pressure_rx) = watch::channel(false);

        let name = program.clone();
        tokio::spawn(async move {
            let reader = stdout.map(|stdout| {
                let events = events_tx.clone();
                let pressure = pressure_rx.clone();
                tokio::spawn(async move {
                    read_loop(stdout, events, pressure).await;
                })
            });

            let stderr_task = stderr.map(|stderr| match stderr_mode {
                StderrMode::Merge => {
                    let events = events_tx.clone();
                    tokio::spawn(async move {
                        let mut stderr = stderr;
                        let mut buf = [0u8; 8192];
                        loop {
                            match stderr.read(&mut buf).await {
                                Ok(0) | Err(_) => break,
                                Ok(n) => {
                                    if events
                                        .send(PipeEvent::Data(Bytes::copy_from_slice(&buf[..n])))
                                        .is_err()
                                    {
                                        break;
                                    }
                                }
                            }
                        }
                    })
                }
                StderrMode::Log => tokio::spawn(async move {
                    let mut lines = BufReader::new(stderr).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        warn!(process = %name, "{line}");
                    }
                }),
            });

            let mut ops_rx = ops_rx;
            let mut stdin = stdin;
            let mut problem = None;
            loop {
                match ops_rx.recv().await {
                    Some(PipeOp::Write(data)) => {
                        if let Some(s) = stdin.as_mut() {
                            if s.write_all(&data).await.is_err() {
                                problem = Some(Problem::InternalError);
                                break;
                            }
                        }
                    }
                    Some(PipeOp::ShutdownWrite) => {
                        stdin = None;
                    }
                    Some(PipeOp::Close(p)) => {
                        problem = p;
                        break;
                    }
                    None => {
                        problem = Some(Problem::Terminated);
                        break;
                    }
                }
            }
            drop(stdin);

            // A problem close is a teardown, not a drain.
            if problem.is_some() {
                let _ = child.start_kill();
            }

            if let Some(reader) = reader {
                let _ = reader.await;
            }
            if let Some(task) = stderr_task {
                task.abort();
            }

            let exit = child.wait().await.ok().map(|status| ExitStatusInfo {
                code: status.code(),
                signal: status.signal(),
            });
            debug!(?exit, "child pipe closed");
            let _ = events_tx.send(PipeEvent::Closed { problem, exit });
        });

        Ok(Self {
            ops_tx,
            events_rx,
            pressure_tx,
        })
    }

    /// Connect to a UNIX stream socket.
    pub async fn connect_unix(path: &str) -> std::io::Result<Self> {
        let stream = tokio::net::UnixStream::connect(path).await?;
        let (read_half, write_half) = stream.into_split();

        let (ops_tx, ops_rx) = unbounded_channel();
        let (events_tx, events_rx) = unbounded_channel();
        let (pressure_tx, pressure_rx) = watch::channel(false);

        tokio::spawn(async move {
            let reader = {
                let events = events_tx.clone();
                tokio::spawn(async move {
                    read_loop(read_half, events, pressure_rx).await;
                })
            };

            let mut ops_rx = ops_rx;
            let mut write_half = Some(write_half);
            let mut problem = None;
            loop {
                match ops_rx.recv().await {
                    Some(PipeOp::Write(data)) => {
                        if let Some(w) = write_half.as_mut() {
                            if w.write_all(&data).await.is_err() {
                                problem = Some(Problem::InternalError);
                                break;
                            }
                        }
                    }
                    Some(PipeOp::ShutdownWrite) => {
                        if let Some(w) = write_half.as_mut() {
                            let _ = w.shutdown().await;
                        }
                        write_half = None;
                    }
                    Some(PipeOp::Close(p)) => {
                        problem = p;
                        break;
                    }
                    None => {
                        problem = Some(Problem::Terminated);
                        break;
                    }
                }
            }
            drop(write_half);
            reader.abort();
            let _ = events_tx.send(PipeEvent::Closed {
                problem,
                exit: None,
            });
        });

        Ok(Self {
            ops_tx,
            events_rx,
            pressure_tx,
        })
    }

    /// Spawn `argv` on a pty; stdout and stderr are inherently merged.
    pub fn spawn_pty(
        argv: &[String],
        environ: &[String],
        directory: Option<&str>,
    ) -> std::io::Result<Self> {
        use portable_pty::{native_pty_system, CommandBuilder, PtySize};

        let Some(program) = argv.first() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty argv",
            ));
        };

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(io_other)?;

        let mut builder = CommandBuilder::new(program);
        builder.args(&argv[1..]);
        for entry in environ {
            if let Some((key, value)) = entry.split_once('=') {
                builder.env(key, value);
            }
        }
        if let Some(directory) = directory {
            builder.cwd(directory);
        }

        let mut child = pair.slave.spawn_command(builder).map_err(io_other)?;
        drop(pair.slave);
        let master = pair.master;
        let mut reader = master.try_clone_reader().map_err(io_other)?;
        let mut writer = Some(master.take_writer().map_err(io_other)?);

        let (ops_tx, mut ops_rx) = unbounded_channel::<PipeOp>();
        let (events_tx, events_rx) = unbounded_channel();
        // The pty master's buffer is small; pressure is left to it.
        let (pressure_tx, _) = watch::channel(false);

        let read_events = events_tx.clone();
        let reader_thread = std::thread::spawn(move || {
            let mut buf = [0u8; 8192];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => {
                        let _ = read_events.send(PipeEvent::Eof);
                        break;
                    }
                    Ok(n) => {
                        if read_events
                            .send(PipeEvent::Data(Bytes::copy_from_slice(&buf[..n])))
                            .is_err()
                        {
                            break;
                        }
                    }
                }
            }
        });

        std::thread::spawn(move || {
            let mut problem = None;
            loop {
                match ops_rx.blocking_recv() {
                    Some(PipeOp::Write(data)) => {
                        if let Some(w) = writer.as_mut() {
                            if w.write_all(&data).is_err() {
                                problem = Some(Problem::InternalError);
                                break;
                            }
                        }
                    }
                    Some(PipeOp::ShutdownWrite) => {
                        writer = None;
                    }
                    Some(PipeOp::Close(p)) => {
                        problem = p;
                        break;
                    }
                    None => {
                        problem = Some(Problem::Terminated);
                        break;
                    }
                }
            }
            drop(writer);
            if problem.is_some() {
                let _ = child.kill();
            }
            let status = child.wait().ok();
            drop(master);
            let _ = reader_thread.join();
            let exit = status.map(|status| ExitStatusInfo {
                code: Some(status.exit_code() as i32),
                signal: None,
            });
            let _ = events_tx.send(PipeEvent::Closed { problem, exit });
        });

        Ok(Self {
            ops_tx,
            events_rx,
            pressure_tx,
        })
    }
}

/// Shovel reads into the event queue until end of data, holding off
/// while pressure is on.
async fn read_loop<R: tokio::io::AsyncRead + Unpin>(
    mut reader: R,
    events: UnboundedSender<PipeEvent>,
    mut pressure: watch::Receiver<bool>,
) {
    let mut buf = [0u8; 8192];
    loop {
        while *pressure.borrow() {
            if pressure.changed().await.is_err() {
                break;
            }
        }
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => {
                let _ = events.send(PipeEvent::Eof);
                break;
            }
            Ok(n) => {
                if events
                    .send(PipeEvent::Data(Bytes::copy_from_slice(&buf[..n])))
                    .is_err()
                {
                    break;
                }
            }
        }
    }
}

fn io_other(error: impl std::fmt::Display) -> std::io::Error {
    std::io::Error::other(error.to_string())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["/bin/sh".into(), "-c".into(), script.into()]
    }

    async fn collect_until_closed(pipe: &mut Pipe) -> (Vec<u8>, Option<Problem>, Option<ExitStatusInfo>) {
        let mut data = Vec::new();
        loop {
            match pipe.next_event().await {
                Some(PipeEvent::Data(chunk)) => data.extend_from_slice(&chunk),
                Some(PipeEvent::Eof) => pipe.close(None),
                Some(PipeEvent::Closed { problem, exit }) => return (data, problem, exit),
                None => panic!("pipe events ended without close"),
            }
        }
    }

    #[tokio::test]
    async fn test_spawn_reads_output_and_exit_status() {
        let mut pipe = Pipe::spawn(&sh("echo hi; exit 7"), &[], None, StderrMode::Log).unwrap();
        let (data, problem, exit) = collect_until_closed(&mut pipe).await;
        assert_eq!(data, b"hi\n");
        assert_eq!(problem, None);
        let exit = exit.unwrap();
        assert_eq!(exit.code, Some(7));
        assert_eq!(exit.signal, None);
    }

    #[tokio::test]
    async fn test_spawn_reports_exit_signal() {
        let mut pipe = Pipe::spawn(&sh("kill -TERM $$"), &[], None, StderrMode::Log).unwrap();
        let (_, _, exit) = collect_until_closed(&mut pipe).await;
        let exit = exit.unwrap();
        assert_eq!(exit.code, None);
        assert_eq!(exit.signal, Some(15));
        assert_eq!(signal_name(15), "TERM");
    }

    #[tokio::test]
    async fn test_spawn_write_roundtrip() {
        let mut pipe = Pipe::spawn(&sh("cat"), &[], None, StderrMode::Log).unwrap();
        pipe.write(Bytes::from_static(b"marmalade"));
        pipe.shutdown_write();
        let (data, problem, exit) = collect_until_closed(&mut pipe).await;
        assert_eq!(data, b"marmalade");
        assert_eq!(problem, None);
        assert_eq!(exit.unwrap().code, Some(0));
    }

    #[tokio::test]
    async fn test_spawn_merges_stderr() {
        let mut pipe = Pipe::spawn(
            &sh("echo oops 1>&2; sleep 0.1"),
            &[],
            None,
            StderrMode::Merge,
        )
        .unwrap();
        let (data, _, _) = collect_until_closed(&mut pipe).await;
        assert_eq!(data, b"oops\n");
    }

    #[tokio::test]
    async fn test_spawn_environ_and_directory() {
        let mut pipe = Pipe::spawn(
            &sh("echo $GREETING; pwd"),
            &["GREETING=ahoy".into()],
            Some("/tmp"),
            StderrMode::Log,
        )
        .unwrap();
        let (data, _, _) = collect_until_closed(&mut pipe).await;
        assert_eq!(data, b"ahoy\n/tmp\n");
    }

    #[tokio::test]
    async fn test_pressure_pauses_reading() {
        let mut pipe = Pipe::spawn(&sh("yes pressure"), &[], None, StderrMode::Log).unwrap();

        match tokio::time::timeout(Duration::from_secs(2), pipe.next_event()).await {
            Ok(Some(PipeEvent::Data(_))) => {}
            other => panic!("expected data, got {other:?}"),
        }

        pipe.set_pressure(true);
        // Drain whatever was already in flight; then the source must go
        // quiet.
        loop {
            match tokio::time::timeout(Duration::from_millis(250), pipe.next_event()).await {
                Ok(Some(PipeEvent::Data(_))) => continue,
                Err(_) => break,
                other => panic!("expected silence under pressure, got {other:?}"),
            }
        }

        pipe.set_pressure(false);
        match tokio::time::timeout(Duration::from_secs(2), pipe.next_event()).await {
            Ok(Some(PipeEvent::Data(_))) => {}
            other => panic!("expected reads to resume, got {other:?}"),
        }

        pipe.close(Some(Problem::Terminated));
        loop {
            match pipe.next_event().await {
                Some(PipeEvent::Closed { .. }) => break,
                Some(_) => {}
                None => panic!("pipe events ended without close"),
            }
        }
    }

    #[tokio::test]
    async fn test_connect_unix_roundtrip() {
        let path = std::env::temp_dir().join(format!("hatchway-pipe-{}.sock", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let listener = tokio::net::UnixListener::bind(&path).unwrap();

        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let (mut r, mut w) = conn.split();
            r.read_to_end(&mut buf).await.unwrap();
            w.write_all(&buf).await.unwrap();
        });

        let mut pipe = Pipe::connect_unix(path.to_str().unwrap()).await.unwrap();
        pipe.write(Bytes::from_static(b"over the wire"));
        pipe.shutdown_write();
        let (data, problem, exit) = collect_until_closed(&mut pipe).await;
        assert_eq!(data, b"over the wire");
        assert_eq!(problem, None);
        assert!(exit.is_none());

        let _ = std::fs::remove_file(&path);
    }
}
