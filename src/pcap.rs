//! The packet capture pipeline of spp_pcap.
//!
//! One receive lcore bursts the capture port into a bounded ring; one or
//! more writer lcores drain it into LZ4-framed pcap files, rotating on a
//! size limit. Capture is toggled through a `(request, status)` word pair:
//! the controller flips the request, the receiver acknowledges through the
//! status once it actually transitioned, and the writers follow the status.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use lz4::{BlockMode, BlockSize, ContentChecksum, Encoder, EncoderBuilder};
use num_traits::FromPrimitive;

use crate::comp::ComponentKind;
use crate::context::Context;
use crate::errors::{Error, Result};
use crate::lcore::LcoreStatus;
use crate::mbuf::Mbuf;
use crate::port::{PortId, PortRef};
use crate::ring::Ring;
use crate::MAX_LCORE;
use crate::MAX_PKT_BURST;

/// Capacity of the ring between receiver and writers.
pub const RING_SIZE: usize = 8192;

/// Default rotation limit of one capture file.
pub const DEFAULT_FILE_LIMIT: u64 = 1_073_741_824;

/// Default output directory of capture files.
pub const DEFAULT_OUTPUT_DIR: &str = "/tmp";

const TCPDUMP_MAGIC: u32 = 0xa1b2_c3d4;
const PCAP_VERSION_MAJOR: u16 = 2;
const PCAP_VERSION_MINOR: u16 = 4;
const PCAP_SNAPLEN_MAX: u32 = 65535;
/// 1 means LINKTYPE_ETHERNET.
const PCAP_LINKTYPE: u32 = 1;

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum CaptureStatus {
    Idle = 0,
    Running,
}

/// The shared capture control word pair.
pub struct CaptureCtl {
    request: AtomicU32,
    status: AtomicU32,
}

impl Default for CaptureCtl {
    fn default() -> Self {
        CaptureCtl {
            request: AtomicU32::new(CaptureStatus::Idle as u32),
            status: AtomicU32::new(CaptureStatus::Idle as u32),
        }
    }
}

impl CaptureCtl {
    pub fn request(&self) -> CaptureStatus {
        CaptureStatus::from_u32(self.request.load(Ordering::Acquire)).unwrap_or(CaptureStatus::Idle)
    }

    pub fn set_request(&self, status: CaptureStatus) {
        self.request.store(status as u32, Ordering::Release);
    }

    pub fn status(&self) -> CaptureStatus {
        CaptureStatus::from_u32(self.status.load(Ordering::Acquire)).unwrap_or(CaptureStatus::Idle)
    }

    pub fn set_status(&self, status: CaptureStatus) {
        self.status.store(status as u32, Ordering::Release);
    }
}

/// Capture configuration fixed at startup.
pub struct PcapOption {
    pub file_path: PathBuf,
    pub file_limit: u64,
    pub port_cap: PortRef,
    pub cap_ring: Ring,
    /// Wall-clock date of the running capture, set by the receiver when it
    /// transitions to Running and read by the writers at file open.
    file_date: Mutex<String>,
}

/// Per-lcore capture role metadata shared with the status responder.
#[derive(Clone, Debug, Default)]
pub struct PcapStatusInfo {
    pub role: Option<ComponentKind>,
    pub thread_no: usize,
    pub running: bool,
    /// Final name of the file currently being written, if any.
    pub file_name: String,
}

/// Capture state of the pcap process.
pub struct PcapCtx {
    pub opt: PcapOption,
    pub infos: Vec<Mutex<PcapStatusInfo>>,
}

impl PcapCtx {
    pub fn new(file_path: PathBuf, file_limit: u64, port_cap: PortRef, client_id: i32) -> PcapCtx {
        let cap_ring = Ring::create(&format!("cap_ring_{}", client_id), RING_SIZE);
        PcapCtx {
            opt: PcapOption {
                file_path,
                file_limit,
                port_cap,
                cap_ring,
                file_date: Mutex::new(String::new()),
            },
            infos: (0..MAX_LCORE).map(|_| Mutex::new(PcapStatusInfo::default())).collect(),
        }
    }

    /// Bind capture roles to the slave lcores: thread 0 receives, the rest
    /// write.
    pub fn assign_threads(&self, slave_ids: &[u32]) {
        for (thread_no, lcore_id) in slave_ids.iter().enumerate() {
            let mut info = self.infos[*lcore_id as usize].lock().unwrap();
            info.thread_no = thread_no;
            info.role = Some(if thread_no == 0 {
                ComponentKind::PcapReceiver
            } else {
                ComponentKind::PcapWriter
            });
        }
    }
}

/// A writer counting the compressed bytes that reached the file.
struct CountingFile {
    file: File,
    written: u64,
}

impl Write for CountingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// File-writing state owned by one writer lcore.
pub struct WriterState {
    lcore_id: u32,
    thread_no: usize,
    file_no: u32,
    file_name: String,
    out: Option<Encoder<CountingFile>>,
}

impl WriterState {
    fn new(lcore_id: u32, thread_no: usize) -> WriterState {
        WriterState {
            lcore_id,
            thread_no,
            file_no: 0,
            file_name: String::new(),
            out: None,
        }
    }

    fn file_size(&self) -> u64 {
        self.out.as_ref().map_or(0, |enc| enc.writer().written)
    }
}

fn capture_file_name(opt: &PcapOption, thread_no: usize, file_no: u32) -> String {
    format!(
        "spp_pcap.{}.{}{}.{}.{}.pcap.lz4",
        opt.file_date.lock().unwrap(),
        opt.port_cap.uid.kind,
        opt.port_cap.uid.no,
        thread_no,
        file_no
    )
}

fn lz4_err(err: io::Error) -> Error {
    Error::Lz4(err.to_string())
}

/// Open the next `.tmp` capture file: LZ4 frame header first, then the
/// global pcap header streamed through the compressor.
fn open_capture_file(ctx: &Context, opt: &PcapOption, state: &mut WriterState) -> Result<()> {
    state.file_name = capture_file_name(opt, state.thread_no, state.file_no);
    let tmp = opt.file_path.join(format!("{}.tmp", state.file_name));
    info!("open compress filename={}", tmp.display());

    let file = File::create(&tmp)?;
    let mut encoder = EncoderBuilder::new()
        .block_size(BlockSize::Max256KB)
        .block_mode(BlockMode::Linked)
        .checksum(ContentChecksum::NoChecksum)
        .build(CountingFile { file, written: 0 })
        .map_err(lz4_err)?;

    let mut header = Vec::with_capacity(24);
    header.extend_from_slice(&TCPDUMP_MAGIC.to_ne_bytes());
    header.extend_from_slice(&PCAP_VERSION_MAJOR.to_ne_bytes());
    header.extend_from_slice(&PCAP_VERSION_MINOR.to_ne_bytes());
    header.extend_from_slice(&0i32.to_ne_bytes()); // thiszone
    header.extend_from_slice(&0u32.to_ne_bytes()); // sigfigs
    header.extend_from_slice(&PCAP_SNAPLEN_MAX.to_ne_bytes());
    header.extend_from_slice(&PCAP_LINKTYPE.to_ne_bytes());
    encoder.write_all(&header).map_err(lz4_err)?;

    state.out = Some(encoder);

    let mut info = ctx.pcap.as_ref().unwrap().infos[state.lcore_id as usize]
        .lock()
        .unwrap();
    info.file_name = state.file_name.clone();
    Ok(())
}

/// Finish the LZ4 frame, flush, and rename `.tmp` to the final name.
fn close_capture_file(ctx: &Context, opt: &PcapOption, state: &mut WriterState) -> Result<()> {
    let encoder = match state.out.take() {
        Some(encoder) => encoder,
        None => return Ok(()),
    };

    let (mut counting, ret) = encoder.finish();
    ret.map_err(lz4_err)?;
    counting.flush()?;
    drop(counting);

    let tmp = opt.file_path.join(format!("{}.tmp", state.file_name));
    let saved = opt.file_path.join(&state.file_name);
    fs::rename(&tmp, &saved)?;

    let mut info = ctx.pcap.as_ref().unwrap().infos[state.lcore_id as usize]
        .lock()
        .unwrap();
    info.file_name.clear();
    Ok(())
}

/// Close the current file and open the next one of the sequence.
fn rotate_capture_file(ctx: &Context, opt: &PcapOption, state: &mut WriterState) -> Result<()> {
    close_capture_file(ctx, opt, state)?;
    state.file_no += 1;
    open_capture_file(ctx, opt, state)
}

fn realtime_now() -> (u32, u32) {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts);
    }
    (ts.tv_sec as u32, (ts.tv_nsec / 1000) as u32)
}

/// Stream one packet through the compressor, rotating first if the file
/// already reached its size limit.
fn compress_file_packet(
    ctx: &Context,
    opt: &PcapOption,
    state: &mut WriterState,
    pkt: &Mbuf,
) -> Result<()> {
    if state.out.is_none() {
        return Ok(());
    }

    if state.file_size() > opt.file_limit {
        rotate_capture_file(ctx, opt, state)?;
    }

    let packet_len = pkt.pkt_len() as u32;
    let write_len = packet_len.min(PCAP_SNAPLEN_MAX);
    let (ts_sec, ts_usec) = realtime_now();

    let mut header = [0u8; 16];
    header[0..4].copy_from_slice(&ts_sec.to_ne_bytes());
    header[4..8].copy_from_slice(&ts_usec.to_ne_bytes());
    header[8..12].copy_from_slice(&write_len.to_ne_bytes());
    header[12..16].copy_from_slice(&packet_len.to_ne_bytes());

    let encoder = state.out.as_mut().unwrap();
    encoder.write_all(&header).map_err(lz4_err)?;

    let mut remaining = write_len as usize;
    for seg in pkt.seg_bytes() {
        if remaining == 0 {
            break;
        }
        let take = seg.len().min(remaining);
        encoder.write_all(&seg[..take]).map_err(lz4_err)?;
        remaining -= take;
    }

    Ok(())
}

/// One iteration of the receive lcore: track the capture request, stamp
/// the file date on start, and push a burst into the ring.
pub fn pcap_proc_receive(ctx: &Context, lcore_id: u32) -> Result<()> {
    let pcap = ctx.pcap.as_ref().unwrap();
    let opt = &pcap.opt;

    if ctx.capture.request() == CaptureStatus::Idle {
        let mut info = pcap.infos[lcore_id as usize].lock().unwrap();
        if info.running {
            debug!("receive[{}], run->idle", lcore_id);
            info.running = false;
            ctx.capture.set_status(CaptureStatus::Idle);
        }
        return Ok(());
    }

    {
        let mut info = pcap.infos[lcore_id as usize].lock().unwrap();
        if !info.running {
            let now = time::OffsetDateTime::try_now_local()
                .unwrap_or_else(|_| time::OffsetDateTime::now_utc());
            *opt.file_date.lock().unwrap() = now.format("%Y%m%d%H%M%S");
            info.running = true;
            ctx.capture.set_status(CaptureStatus::Running);
            debug!("receive[{}], idle->run", lcore_id);
        }
    }

    let pkts = ctx.abilities.rx_burst(&opt.port_cap.dev, MAX_PKT_BURST);
    if pkts.is_empty() {
        return Ok(());
    }

    let nb_rx = pkts.len();
    let (nb_tx, rest) = opt.cap_ring.enqueue_burst(pkts);
    if nb_tx < nb_rx {
        error!("drop packets(receive) {}", nb_rx - nb_tx);
        drop(rest);
    }

    Ok(())
}

/// One iteration of a writer lcore: follow the capture status, drain a
/// burst from the ring, and stream it into the current file.
pub fn pcap_proc_write(ctx: &Context, lcore_id: u32, state: &mut WriterState) -> Result<()> {
    let pcap = ctx.pcap.as_ref().unwrap();
    let opt = &pcap.opt;

    if ctx.capture.status() == CaptureStatus::Idle {
        let was_running = {
            let mut info = pcap.infos[lcore_id as usize].lock().unwrap();
            let was = info.running;
            info.running = false;
            was
        };
        if was_running {
            debug!("write[{}] run->idle", lcore_id);
            // Drain what the receiver already captured before closing.
            loop {
                let pkts = opt.cap_ring.dequeue_burst(MAX_PKT_BURST);
                if pkts.is_empty() {
                    break;
                }
                for pkt in pkts.iter() {
                    compress_file_packet(ctx, opt, state, pkt)?;
                }
            }
            close_capture_file(ctx, opt, state)?;
        }
        return Ok(());
    }

    {
        let mut info = pcap.infos[lcore_id as usize].lock().unwrap();
        if !info.running {
            debug!("write[{}] idle->run", lcore_id);
            info.running = true;
            drop(info);
            state.file_no = 1;
            if let Err(err) = open_capture_file(ctx, opt, state) {
                let mut info = pcap.infos[lcore_id as usize].lock().unwrap();
                info.running = false;
                return Err(err);
            }
        }
    }

    let pkts = opt.cap_ring.dequeue_burst(MAX_PKT_BURST);
    if pkts.is_empty() {
        return Ok(());
    }

    for (i, pkt) in pkts.iter().enumerate() {
        if let Err(err) = compress_file_packet(ctx, opt, state, pkt) {
            error!("capture file write error: {}", err);
            error!("drop packets(write) {}", pkts.len() - i);
            let mut info = pcap.infos[lcore_id as usize].lock().unwrap();
            info.running = false;
            drop(info);
            let _ = close_capture_file(ctx, opt, state);
            return Err(err);
        }
    }

    Ok(())
}

/// Main loop of one pcap slave lcore; the role is fixed by its thread
/// number (0 receives, the rest write).
pub fn slave_main(ctx: &Context, lcore_id: u32) {
    let pcap = ctx.pcap.as_ref().unwrap();
    let (thread_no, role) = {
        let info = pcap.infos[lcore_id as usize].lock().unwrap();
        (info.thread_no, info.role)
    };

    match role {
        Some(ComponentKind::PcapReceiver) => info!("Core[{}] Start receive.", lcore_id),
        _ => info!("Core[{}] Start write({}).", lcore_id, thread_no),
    }

    let mut state = WriterState::new(lcore_id, thread_no);
    ctx.lcores.set_status(lcore_id, LcoreStatus::Idle);

    loop {
        let status = ctx.lcores.get_status(lcore_id);
        if status == LcoreStatus::StopRequest {
            let running = pcap.infos[lcore_id as usize].lock().unwrap().running;
            if !running {
                break;
            }
            if role == Some(ComponentKind::PcapReceiver) {
                ctx.capture.set_request(CaptureStatus::Idle);
            }
        }
        if status != LcoreStatus::Forward && status != LcoreStatus::StopRequest {
            std::thread::yield_now();
            continue;
        }

        let ret = if role == Some(ComponentKind::PcapReceiver) {
            pcap_proc_receive(ctx, lcore_id)
        } else {
            pcap_proc_write(ctx, lcore_id, &mut state)
        };
        if let Err(err) = ret {
            error!("Core[{}] Thread Error. ({})", lcore_id, err);
            break;
        }
    }

    ctx.lcores.set_status(lcore_id, LcoreStatus::Stop);
    info!("Core[{}] End.", lcore_id);
}

/// The status entry of one pcap lcore.
pub struct PcapCoreStatus {
    pub role: ComponentKind,
    pub rx: Vec<PortId>,
    pub filename: Option<String>,
}

/// Status data of a pcap lcore for the response builder.
pub fn core_status(ctx: &Context, lcore_id: u32) -> Option<PcapCoreStatus> {
    let pcap = ctx.pcap.as_ref()?;
    let info = pcap.infos[lcore_id as usize].lock().unwrap();
    let role = info.role?;

    Some(match role {
        ComponentKind::PcapReceiver => PcapCoreStatus {
            role,
            rx: vec![pcap.opt.port_cap.uid],
            filename: None,
        },
        _ => PcapCoreStatus {
            role,
            rx: Vec::new(),
            filename: if info.file_name.is_empty() {
                None
            } else {
                Some(
                    pcap.opt
                        .file_path
                        .join(&info.file_name)
                        .to_string_lossy()
                        .into_owned(),
                )
            },
        },
    })
}

#[cfg(test)]
mod tests {
    use std::convert::TryInto;
    use std::io::Read;

    use super::*;
    use crate::context::{ProcType, StartupParam};
    use crate::ethdev;
    use crate::port::PortKind;

    fn pcap_ctx(client_id: i32, capture_phy: u16, dir: &std::path::Path, limit: u64) -> Context {
        let phys = ethdev::probe_phys(16);
        let mut ctx = Context::new(
            StartupParam {
                client_id,
                server_ip: "127.0.0.1".into(),
                server_port: 6666,
                vhost_client: false,
                proc_type: ProcType::Pcap,
            },
            2,
            &phys,
        );

        let uid = PortId::new(PortKind::Phy, capture_phy);
        let iface = ctx.mng.lock().unwrap().iface.clone();
        let port_cap = PortRef::resolve(&iface, uid).unwrap();
        let pcap = PcapCtx::new(dir.to_path_buf(), limit, port_cap, client_id);
        pcap.assign_threads(ctx.lcores.slave_ids());
        ctx.pcap = Some(pcap);
        ctx
    }

    fn decode_all(dir: &std::path::Path) -> Vec<Vec<u8>> {
        // concatenate the decompressed packet stream of all capture files
        // in file_no order
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.ends_with(".pcap.lz4"))
            .collect();
        names.sort_by_key(|n| {
            n.rsplit('.')
                .nth(2)
                .and_then(|no| no.parse::<u32>().ok())
                .unwrap_or(0)
        });

        let mut packets = Vec::new();
        for name in names {
            let mut decoder = lz4::Decoder::new(File::open(dir.join(&name)).unwrap()).unwrap();
            let mut bytes = Vec::new();
            decoder.read_to_end(&mut bytes).unwrap();

            // global header
            assert_eq!(
                u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
                TCPDUMP_MAGIC
            );
            assert_eq!(
                u32::from_ne_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]),
                PCAP_LINKTYPE
            );

            let mut off = 24;
            let mut last_ts = (0u32, 0u32);
            while off < bytes.len() {
                let ts_sec = u32::from_ne_bytes(bytes[off..off + 4].try_into().unwrap());
                let ts_usec = u32::from_ne_bytes(bytes[off + 4..off + 8].try_into().unwrap());
                let incl = u32::from_ne_bytes(bytes[off + 8..off + 12].try_into().unwrap()) as usize;
                let orig = u32::from_ne_bytes(bytes[off + 12..off + 16].try_into().unwrap()) as usize;
                assert_eq!(incl, orig.min(PCAP_SNAPLEN_MAX as usize));
                assert!((ts_sec, ts_usec) >= last_ts);
                last_ts = (ts_sec, ts_usec);
                off += 16;
                packets.push(bytes[off..off + incl].to_vec());
                off += incl;
            }
        }
        packets
    }

    fn run_capture(ctx: &Context, frames: &[Vec<u8>]) {
        let recv_lcore = ctx.lcores.slave_ids()[0];
        let write_lcore = ctx.lcores.slave_ids()[1];
        let opt = &ctx.pcap.as_ref().unwrap().opt;
        let mut state = WriterState::new(write_lcore, 1);

        ctx.capture.set_request(CaptureStatus::Running);
        pcap_proc_receive(ctx, recv_lcore).unwrap();

        for chunk in frames.chunks(MAX_PKT_BURST) {
            opt.port_cap
                .dev
                .inject(chunk.iter().map(|f| Mbuf::from_bytes(f)).collect());
            pcap_proc_receive(ctx, recv_lcore).unwrap();
            pcap_proc_write(ctx, write_lcore, &mut state).unwrap();
        }

        ctx.capture.set_request(CaptureStatus::Idle);
        pcap_proc_receive(ctx, recv_lcore).unwrap();
        assert_eq!(ctx.capture.status(), CaptureStatus::Idle);
        pcap_proc_write(ctx, write_lcore, &mut state).unwrap();
    }

    #[test]
    fn test_capture_roundtrip_single_file() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = pcap_ctx(7, 6, dir.path(), DEFAULT_FILE_LIMIT);

        let frames: Vec<Vec<u8>> = (0..40u8).map(|i| vec![i; 60]).collect();
        run_capture(&ctx, &frames);

        let packets = decode_all(dir.path());
        assert_eq!(packets, frames);

        // single file, tmp renamed away
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with("spp_pcap."));
        assert!(names[0].contains(".phy6."));
        assert!(names[0].ends_with(".1.pcap.lz4"));
    }

    #[test]
    fn test_capture_rotates_on_file_limit() {
        use rand::{thread_rng, RngCore};

        let dir = tempfile::tempdir().unwrap();
        let ctx = pcap_ctx(8, 13, dir.path(), 4096);

        // incompressible payloads so the compressed stream actually grows
        let mut rng = thread_rng();
        let frames: Vec<Vec<u8>> = (0..300u16)
            .map(|_| {
                let mut data = vec![0u8; 1400];
                rng.fill_bytes(&mut data);
                data
            })
            .collect();
        run_capture(&ctx, &frames);

        let packets = decode_all(dir.path());
        assert_eq!(packets, frames);

        let count = fs::read_dir(dir.path()).unwrap().count();
        assert!(count > 1, "expected rotation, got {} file(s)", count);
    }
}
