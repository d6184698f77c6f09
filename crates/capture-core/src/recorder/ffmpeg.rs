//! ffmpeg-backed container writer
//!
//! Teed RTP packets are forwarded over loopback UDP to an ffmpeg process that
//! reads them through a generated SDP description and stream-copies them into
//! the target container. The writer counts as started once the process has
//! survived the start grace period.

use async_trait::async_trait;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::UdpSocket;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::util::Marshal;

use super::{ContainerWriter, RecordingTarget, TrackInput, WriterFactory};
use crate::config::CaptureConfig;
use crate::media::{MediaKind, TrackInfo};
use crate::{Error, Result};

/// How long ffmpeg gets to finalize the container after `q`
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Attempts at finding a free RTP/RTCP port pair
const PORT_ATTEMPTS: usize = 16;

/// Creates [`FfmpegWriter`]s
#[derive(Debug, Clone)]
pub struct FfmpegWriterFactory {
    ffmpeg_path: String,
    start_grace: Duration,
}

impl FfmpegWriterFactory {
    pub fn new(ffmpeg_path: impl Into<String>, start_grace: Duration) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            start_grace,
        }
    }

    pub fn from_config(config: &CaptureConfig) -> Self {
        Self::new(
            config.transcode.ffmpeg_path.clone(),
            config.recorder.start_grace(),
        )
    }
}

impl WriterFactory for FfmpegWriterFactory {
    fn create(&self, target: &RecordingTarget) -> Box<dyn ContainerWriter> {
        Box::new(FfmpegWriter::new(
            target.clone(),
            self.ffmpeg_path.clone(),
            self.start_grace,
        ))
    }
}

/// Container writer running one ffmpeg process
pub struct FfmpegWriter {
    target: RecordingTarget,
    ffmpeg_path: String,
    start_grace: Duration,
    pending: Vec<TrackInput>,
    running: Option<Running>,
}

struct Running {
    child: Child,
    sdp_path: PathBuf,
    shutdown: watch::Sender<bool>,
    pumps: Vec<JoinHandle<TrackInput>>,
}

impl FfmpegWriter {
    pub fn new(target: RecordingTarget, ffmpeg_path: String, start_grace: Duration) -> Self {
        Self {
            target,
            ffmpeg_path,
            start_grace,
            pending: Vec::new(),
            running: None,
        }
    }

    fn sdp_path(&self) -> PathBuf {
        self.target.path.with_extension("sdp")
    }

    fn args(&self, sdp_path: &Path) -> Vec<String> {
        vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-protocol_whitelist".to_string(),
            "file,udp,rtp".to_string(),
            "-fflags".to_string(),
            "+genpts".to_string(),
            "-i".to_string(),
            sdp_path.display().to_string(),
            "-map".to_string(),
            "0".to_string(),
            "-c".to_string(),
            "copy".to_string(),
            "-f".to_string(),
            self.target.format.muxer().to_string(),
            "-y".to_string(),
            self.target.path.display().to_string(),
        ]
    }

    /// Stop forwarding and take the track handles back
    async fn stop_pumps(running: &mut Running) -> Vec<TrackInput> {
        let _ = running.shutdown.send(true);
        let mut inputs = Vec::with_capacity(running.pumps.len());
        for pump in running.pumps.drain(..) {
            match pump.await {
                Ok(input) => inputs.push(input),
                Err(e) => warn!(error = %e, "RTP forwarder task failed"),
            }
        }
        inputs
    }
}

#[async_trait]
impl ContainerWriter for FfmpegWriter {
    async fn add_track(&mut self, input: TrackInput) -> Result<()> {
        // The SDP is fixed once ffmpeg runs; dropping the input releases its tee output
        if self.running.is_some() {
            return Err(Error::RecorderError(format!(
                "{} track arrived after the writer started",
                input.info.kind
            )));
        }
        self.pending.push(input);
        Ok(())
    }

    async fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Ok(());
        }
        if self.pending.is_empty() {
            return Err(Error::RecorderError("no tracks attached".to_string()));
        }

        // Reservations stay bound until just before spawn so every track gets
        // a distinct pair and the forwarders cannot land on one of them
        let mut reservations = Vec::with_capacity(self.pending.len());
        for _ in &self.pending {
            reservations.push(PortReservation::acquire().await?);
        }
        let ports: Vec<u16> = reservations.iter().map(|r| r.port).collect();

        let mut sockets = Vec::with_capacity(ports.len());
        for &port in &ports {
            let socket = UdpSocket::bind(("127.0.0.1", 0)).await?;
            socket.connect(("127.0.0.1", port)).await?;
            sockets.push(socket);
        }

        let sdp_path = self.sdp_path();
        let infos: Vec<&TrackInfo> = self.pending.iter().map(|input| &input.info).collect();
        tokio::fs::write(&sdp_path, build_sdp(&infos, &ports)).await?;

        drop(reservations);
        let spawned = Command::new(&self.ffmpeg_path)
            .args(self.args(&sdp_path))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn();
        let child = match spawned {
            Ok(child) => child,
            Err(e) => {
                let _ = tokio::fs::remove_file(&sdp_path).await;
                return Err(Error::RecorderError(format!("Failed to spawn ffmpeg: {}", e)));
            }
        };

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut pumps = Vec::with_capacity(self.pending.len());
        for (input, socket) in self.pending.drain(..).zip(sockets) {
            pumps.push(tokio::spawn(forward_rtp(input, socket, shutdown_rx.clone())));
        }

        let mut running = Running {
            child,
            sdp_path,
            shutdown,
            pumps,
        };

        tokio::time::sleep(self.start_grace).await;

        match running.child.try_wait() {
            Ok(None) => {
                info!(
                    format = %self.target.format,
                    path = %self.target.path.display(),
                    pid = running.child.id(),
                    "ffmpeg writer running"
                );
                self.running = Some(running);
                Ok(())
            }
            Ok(Some(status)) => {
                self.pending = Self::stop_pumps(&mut running).await;
                let _ = tokio::fs::remove_file(&running.sdp_path).await;
                Err(Error::RecorderError(format!(
                    "ffmpeg exited during start with {}",
                    status
                )))
            }
            Err(e) => {
                self.pending = Self::stop_pumps(&mut running).await;
                let _ = running.child.kill().await;
                let _ = tokio::fs::remove_file(&running.sdp_path).await;
                Err(Error::RecorderError(format!("Failed to poll ffmpeg: {}", e)))
            }
        }
    }

    async fn stop(&mut self) -> Result<()> {
        let Some(mut running) = self.running.take() else {
            return Ok(());
        };

        let inputs = Self::stop_pumps(&mut running).await;
        self.pending.extend(inputs);

        // `q` on stdin makes ffmpeg write the container trailer
        if let Some(mut stdin) = running.child.stdin.take() {
            let _ = stdin.write_all(b"q").await;
        }

        let result = match tokio::time::timeout(STOP_TIMEOUT, running.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(status = %status, path = %self.target.path.display(), "ffmpeg writer exited");
                Ok(())
            }
            Ok(Err(e)) => Err(Error::RecorderError(format!("Failed to wait for ffmpeg: {}", e))),
            Err(_) => {
                warn!(path = %self.target.path.display(), "ffmpeg writer did not exit in time, killing");
                let _ = running.child.kill().await;
                Err(Error::OperationTimeout("ffmpeg writer stop".to_string()))
            }
        };

        let _ = tokio::fs::remove_file(&running.sdp_path).await;
        result
    }

    async fn detach_tracks(&mut self) -> Vec<TrackInput> {
        if let Some(running) = self.running.as_mut() {
            let inputs = Self::stop_pumps(running).await;
            self.pending.extend(inputs);
        }
        std::mem::take(&mut self.pending)
    }
}

/// Forward packets from a tee output to ffmpeg until shutdown or end of stream
async fn forward_rtp(
    mut input: TrackInput,
    socket: UdpSocket,
    mut shutdown: watch::Receiver<bool>,
) -> TrackInput {
    let mut forwarded = 0u64;
    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => break,

            frame = input.frames.recv() => {
                let Some(packet) = frame else { break };
                match packet.marshal() {
                    Ok(buf) => {
                        // Refused sends just mean ffmpeg has not bound yet
                        if let Err(e) = socket.send(&buf).await {
                            debug!(kind = %input.info.kind, error = %e, "RTP forward failed");
                        } else {
                            forwarded += 1;
                        }
                    }
                    Err(e) => debug!(kind = %input.info.kind, error = %e, "RTP marshal failed"),
                }
            }
        }
    }
    debug!(kind = %input.info.kind, forwarded, "RTP forwarder stopped");
    input
}

/// Loopback RTP/RTCP port pair held open until ffmpeg is about to bind it
struct PortReservation {
    port: u16,
    _rtp: UdpSocket,
    _rtcp: UdpSocket,
}

impl PortReservation {
    async fn acquire() -> Result<Self> {
        for _ in 0..PORT_ATTEMPTS {
            let rtp = UdpSocket::bind(("127.0.0.1", 0)).await?;
            let port = rtp.local_addr()?.port();
            if port == u16::MAX {
                continue;
            }
            if let Ok(rtcp) = UdpSocket::bind(("127.0.0.1", port + 1)).await {
                return Ok(Self {
                    port,
                    _rtp: rtp,
                    _rtcp: rtcp,
                });
            }
        }
        Err(Error::RecorderError("no free RTP port pair on loopback".to_string()))
    }
}

/// SDP describing one RTP stream per track, as read by ffmpeg
pub fn build_sdp(tracks: &[&TrackInfo], ports: &[u16]) -> String {
    let mut sdp = String::from(
        "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=capture\r\nc=IN IP4 127.0.0.1\r\nt=0 0\r\n",
    );
    for (info, port) in tracks.iter().zip(ports) {
        let codec = &info.codec;
        let media = match info.kind {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        };
        let _ = write!(
            sdp,
            "m={} {} RTP/AVP {}\r\na=rtpmap:{} {}/{}",
            media,
            port,
            codec.payload_type,
            codec.payload_type,
            codec.encoding_name(),
            codec.clock_rate
        );
        if info.kind == MediaKind::Audio && codec.channels > 0 {
            let _ = write!(sdp, "/{}", codec.channels);
        }
        sdp.push_str("\r\n");
        if codec.encoding_name().eq_ignore_ascii_case("H264") {
            let _ = write!(sdp, "a=fmtp:{} packetization-mode=1\r\n", codec.payload_type);
        }
    }
    sdp
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{CodecInfo, ContainerFormat, RtpTee};

    fn info(kind: MediaKind, codec: CodecInfo) -> TrackInfo {
        TrackInfo {
            track_id: format!("{}-track", kind),
            kind,
            codec,
        }
    }

    #[test]
    fn test_build_sdp() {
        let video = info(MediaKind::Video, CodecInfo::vp8(96));
        let audio = info(MediaKind::Audio, CodecInfo::opus(111));
        let sdp = build_sdp(&[&video, &audio], &[40000, 40002]);

        assert!(sdp.starts_with("v=0\r\n"));
        assert!(sdp.contains("m=video 40000 RTP/AVP 96\r\na=rtpmap:96 VP8/90000\r\n"));
        assert!(sdp.contains("m=audio 40002 RTP/AVP 111\r\na=rtpmap:111 opus/48000/2\r\n"));
        assert!(!sdp.contains("fmtp"));
    }

    #[test]
    fn test_build_sdp_h264_packetization() {
        let h264 = info(
            MediaKind::Video,
            CodecInfo {
                mime_type: "video/H264".to_string(),
                clock_rate: 90000,
                channels: 0,
                payload_type: 102,
            },
        );
        let sdp = build_sdp(&[&h264], &[41000]);
        assert!(sdp.contains("a=fmtp:102 packetization-mode=1\r\n"));
    }

    #[test]
    fn test_ffmpeg_args_use_target_muxer() {
        let target = RecordingTarget::in_dir(Path::new("/tmp/x"), "s1", ContainerFormat::Webm);
        let writer = FfmpegWriter::new(target, "ffmpeg".to_string(), Duration::from_millis(10));
        let args = writer.args(Path::new("/tmp/x/s1.sdp"));

        let f = args.iter().position(|a| a == "-f").unwrap();
        assert_eq!(args[f + 1], "webm");
        assert_eq!(args.last().unwrap(), "/tmp/x/s1.webm");
        assert_eq!(writer.sdp_path(), PathBuf::from("/tmp/x/s1.sdp"));
    }

    #[tokio::test]
    async fn test_start_without_tracks_fails() {
        let target = RecordingTarget::in_dir(Path::new("/tmp"), "none", ContainerFormat::Matroska);
        let mut writer = FfmpegWriter::new(target, "ffmpeg".to_string(), Duration::from_millis(10));
        assert!(matches!(writer.start().await, Err(Error::RecorderError(_))));
        assert!(writer.stop().await.is_ok());
    }

    #[tokio::test]
    async fn test_held_port_reservations_do_not_overlap() {
        let mut held = Vec::new();
        for _ in 0..8 {
            held.push(PortReservation::acquire().await.unwrap());
        }

        let mut taken: Vec<u16> = held.iter().flat_map(|r| [r.port, r.port + 1]).collect();
        taken.sort_unstable();
        taken.dedup();
        assert_eq!(taken.len(), 16);

        // The pair cannot be bound by anyone else while reserved
        let first = held[0].port;
        assert!(UdpSocket::bind(("127.0.0.1", first)).await.is_err());
        assert!(UdpSocket::bind(("127.0.0.1", first + 1)).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_binary_fails_start_and_keeps_tracks() {
        let dir = tempfile::tempdir().unwrap();
        let target = RecordingTarget::in_dir(dir.path(), "s1", ContainerFormat::Matroska);
        let mut writer = FfmpegWriter::new(
            target,
            "/nonexistent/ffmpeg-binary".to_string(),
            Duration::from_millis(10),
        );
        let tee = RtpTee::new();
        writer
            .add_track(TrackInput {
                info: info(MediaKind::Video, CodecInfo::vp8(96)),
                frames: tee.subscribe(),
            })
            .await
            .unwrap();

        assert!(matches!(writer.start().await, Err(Error::RecorderError(_))));
        assert_eq!(writer.detach_tracks().await.len(), 1);
    }
}
