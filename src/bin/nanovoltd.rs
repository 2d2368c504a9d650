//! Appliance daemon.
//!
//! Runs the acquisition core against the simulated converter and serves
//! ADCP on a TCP port. On real hardware the simulated driver is replaced
//! by the converter's register driver; everything above it is identical.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use log::info;

use nanovolt::adc::sim::SimAdc;
use nanovolt::adc::AdcDriver;
use nanovolt::net::bind_listener;
use nanovolt::sd_config::NetworkConfig;
use nanovolt::Instrument;

fn usage() -> ! {
    eprintln!("usage: nanovoltd [--data-dir DIR] [--listen ADDR:PORT]");
    std::process::exit(2);
}

fn main() {
    env_logger::init();

    let mut data_dir = PathBuf::from("data");
    let mut listen: SocketAddr = "0.0.0.0:4950".parse().unwrap();

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--data-dir" => match args.next() {
                Some(dir) => data_dir = PathBuf::from(dir),
                None => usage(),
            },
            "--listen" => match args.next().and_then(|a| a.parse().ok()) {
                Some(addr) => listen = addr,
                None => usage(),
            },
            _ => usage(),
        }
    }

    let network = NetworkConfig::load(&data_dir);
    if network.use_dhcp {
        info!("network config: dhcp");
    } else {
        info!(
            "network config: ip {} netmask {} gateway {}",
            network.ip, network.netmask, network.gateway
        );
    }

    let adc: Arc<dyn AdcDriver> = Arc::new(SimAdc::new());
    let instrument = Instrument::new(adc, &data_dir);

    let listener = match bind_listener(listen) {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("cannot bind {}: {}", listen, e);
            std::process::exit(1);
        }
    };

    let server = instrument.serve(listener);
    let _ = server.join();
}
