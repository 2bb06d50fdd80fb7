use chrono::Utc;
use clap::{App, Arg};
use masche::capture::{CaptureHandle, CaptureSocket, SNAPLEN};
use masche::classify::Engine;
use masche::eventloop::EventLoop;
use masche::flow::FlowTable;
use masche::ipfix::Exporter;
use masche::xml::XmlExport;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let app = App::new("masche")
        .arg(
            Arg::with_name("config")
                .short("f")
                .value_name("PATH")
                .required(true)
                .takes_value(true)
                .help("configuration file"),
        )
        .arg(
            Arg::with_name("verbosity")
                .short("v")
                .value_name("X")
                .takes_value(true)
                .default_value("2")
                .help("verbosity level (0-5)"),
        )
        .get_matches();

    let verbosity: u8 = app
        .value_of("verbosity")
        .and_then(|v| v.parse().ok())
        .unwrap_or(2);
    tracing_subscriber::fmt()
        .with_max_level(match verbosity {
            0 => tracing::Level::ERROR,
            1 => tracing::Level::WARN,
            2 => tracing::Level::INFO,
            3 => tracing::Level::DEBUG,
            _ => tracing::Level::TRACE,
        })
        .init();

    let conf = Rc::new(masche::config::read_config(
        app.value_of("config").unwrap(),
    )?);

    let mut exporter = Exporter::new(conf.observation_domain_id);
    if let Some(method) = &conf.compression_method {
        exporter.init_compression(
            method,
            conf.compression_method_params.as_deref().unwrap_or(""),
        )?;
    }

    for collector in &conf.collectors {
        match exporter.add_collector(collector.ip, collector.port, collector.transport, 1500) {
            Ok(()) => {}
            Err(err) => tracing::error!("{:#}", err),
        }
    }

    tracing::info!("declaring templates");
    masche::export::declare_templates(&mut exporter)?;
    masche::record::declare_record_templates(&mut exporter, &conf.records)?;

    let event_loop = EventLoop::new();

    let engine = Rc::new(RefCell::new(Engine::new(
        FlowTable::new(
            chrono::Duration::seconds(conf.export_timeout as i64),
            chrono::Duration::seconds(conf.max_flow_lifetime as i64),
        ),
        conf.olsr_port,
    )));
    let exporter = Rc::new(RefCell::new(exporter));

    let mut captures: Vec<CaptureHandle> = Vec::new();
    for ifname in &conf.interfaces {
        let socket = match CaptureSocket::open(ifname) {
            Ok(socket) => socket,
            Err(err) => {
                tracing::error!("skipping interface {}: {:#}", ifname, err);
                continue;
            }
        };

        let handle = CaptureHandle(Rc::new(socket));
        captures.push(handle.clone());

        let engine = engine.clone();
        event_loop.add_fd(handle.clone(), move |capture| {
            let mut buf = [0u8; SNAPLEN];
            let mut engine = engine.borrow_mut();
            loop {
                match capture.next_packet(&mut buf) {
                    Ok((snap_len, wire_len)) => {
                        engine.process_frame(&buf[..snap_len], wire_len as u64, Utc::now())
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(err) => {
                        tracing::error!("capture read failed on {}: {}", capture.name(), err);
                        break;
                    }
                }
            }
        })?;
        tracing::info!("capturing on {}", ifname);
    }

    if captures.is_empty() {
        anyhow::bail!("no capture interface could be opened");
    }

    {
        let engine = engine.clone();
        let exporter = exporter.clone();
        event_loop.add_timer(Duration::from_secs(conf.flow_export_interval), move || {
            let mut engine = engine.borrow_mut();
            let mut exporter = exporter.borrow_mut();
            if let Err(err) =
                masche::export::export_flows(&mut exporter, &mut engine.flows, Utc::now())
            {
                tracing::error!("flow export failed: {:#}", err);
                exporter.abort_message();
            }
        });
    }

    {
        let engine = engine.clone();
        let exporter = exporter.clone();
        event_loop.add_timer(
            Duration::from_secs(conf.topology_export_interval),
            move || {
                let mut engine = engine.borrow_mut();
                let mut exporter = exporter.borrow_mut();
                if let Err(err) =
                    masche::export::export_topology(&mut exporter, &mut engine.nodes, Utc::now())
                {
                    tracing::error!("topology export failed: {:#}", err);
                    exporter.abort_message();
                }
            },
        );
    }

    {
        let exporter = exporter.clone();
        let captures = captures.clone();
        event_loop.add_timer(Duration::from_secs(conf.stats_interval), move || {
            let mut exporter = exporter.borrow_mut();
            if let Err(err) = masche::export::export_capture_stats(&mut exporter, &captures) {
                tracing::error!("capture statistics export failed: {:#}", err);
                exporter.abort_message();
            }
        });
    }

    {
        let conf = conf.clone();
        let engine = engine.clone();
        let exporter = exporter.clone();
        let mut xml = conf
            .xmlfile
            .as_ref()
            .map(|path| XmlExport::new(path, conf.xmlpostprocessing.clone()));

        event_loop.add_timer(Duration::from_secs(conf.interval), move || {
            tracing::info!("export status at {}", Utc::now().format("%X"));

            {
                let mut exporter = exporter.borrow_mut();
                if !conf.records.is_empty() && exporter.collector_count() > 0 {
                    if let Err(err) = masche::record::export_records(&mut exporter, &conf.records) {
                        tracing::error!("record export failed: {:#}", err);
                        exporter.abort_message();
                    }
                }
            }

            if let Some(xml) = &mut xml {
                let (flow_count, node_count) = {
                    let engine = engine.borrow();
                    (engine.flows.len(), engine.nodes.len())
                };
                if let Err(err) = xml.update(&conf.records, flow_count, node_count, Utc::now()) {
                    tracing::error!("{:#}", err);
                }
            }
        });
    }

    tracing::info!("masche is up and running, press Ctrl-C to exit");
    event_loop.run().await
}
