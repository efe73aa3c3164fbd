use std::path::PathBuf;

use clap::Parser;
use kmspool::backend::{
    allocator::{
        dumb::{DrmDumbDevice, ExportMode, KmsAllocator},
        format::VideoFrameDescriptor,
        Fourcc,
    },
    pool::{BufferPool, MapFlags, PoolConfig},
    remote::RemoteBuffer,
    wayland::WaylandTransport,
};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Allocate a pool of compositor shared video buffers", long_about = None)]
struct Cli {
    /// DRM device node creating the dumb buffers
    #[arg(short, long, default_value = "/dev/dri/card0")]
    device: PathBuf,
    #[arg(long, default_value_t = 1920)]
    width: u32,
    #[arg(long, default_value_t = 1080)]
    height: u32,
    #[arg(short, long, default_value = "Nv12", value_parser = fourcc_from_string)]
    fourcc: Fourcc,
    /// Export the planes without mapping them at allocation time
    #[arg(long)]
    dmabuf_only: bool,
    /// Fill value written to every byte of the first plane
    #[arg(long, default_value_t = 0x80)]
    fill: u8,
}

fn fourcc_from_string(name: &str) -> Result<Fourcc, &'static str> {
    Ok(match name {
        "Xrgb8888" => Fourcc::Xrgb8888,
        "Argb8888" => Fourcc::Argb8888,
        "Xbgr8888" => Fourcc::Xbgr8888,
        "Abgr8888" => Fourcc::Abgr8888,
        "Rgb565" => Fourcc::Rgb565,
        "Rgb888" => Fourcc::Rgb888,
        "Bgr888" => Fourcc::Bgr888,
        "Yuyv" => Fourcc::Yuyv,
        "Uyvy" => Fourcc::Uyvy,
        "Nv12" => Fourcc::Nv12,
        "Nv21" => Fourcc::Nv21,
        "Nv16" => Fourcc::Nv16,
        "Nv61" => Fourcc::Nv61,
        "Yuv420" => Fourcc::Yuv420,
        "Yvu420" => Fourcc::Yvu420,
        "Yuv422" => Fourcc::Yuv422,
        "Yuv444" => Fourcc::Yuv444,
        _ => return Err("Unsupported fourcc"),
    })
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Cli::parse();

    if let Ok(env_filter) = tracing_subscriber::EnvFilter::try_from_default_env() {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    } else {
        tracing_subscriber::fmt().init();
    }

    let transport = WaylandTransport::connect()?;
    info!(formats = transport.formats().len(), "connected to the compositor");
    let dispatcher = transport.spawn_dispatcher()?;

    let mode = if args.dmabuf_only {
        ExportMode::DmabufOnly
    } else {
        ExportMode::Mapped
    };
    let device = DrmDumbDevice::open(&args.device)?;
    let mut pool = BufferPool::new(KmsAllocator::new(device, mode), transport);

    let descriptor = VideoFrameDescriptor::new(args.width, args.height, args.fourcc)?;
    let config = pool.set_config(PoolConfig::new(descriptor))?;
    info!(size = config.size, buffers = config.max_buffers, "configured pool");
    pool.start()?;

    let mut acquired = Vec::new();
    while let Some(buffer) = pool.acquire()? {
        match buffer.map_plane(0, MapFlags::WRITE) {
            Ok(mut plane) => {
                if let Some(bytes) = plane.as_mut_slice() {
                    bytes.fill(args.fill);
                }
            }
            Err(err) => warn!(?err, "failed to map the first plane"),
        }

        for (idx, plane) in buffer.planes().iter().enumerate() {
            let layout = plane.layout();
            info!(
                buffer = ?buffer.remote().id(),
                plane = idx,
                stride = layout.stride,
                offset = layout.offset,
                fd = ?plane.fd(),
                "plane"
            );
        }
        acquired.push(buffer);
    }
    info!(buffers = acquired.len(), registered = pool.registry().len(), "pool exhausted");

    drop(acquired);
    pool.stop()?;
    dispatcher.stop()?;
    Ok(())
}
