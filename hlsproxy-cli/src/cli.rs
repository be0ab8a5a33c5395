use hlsproxy::policy::Quality;
use std::net::IpAddr;
use structopt::*;
use url::Url;

#[derive(StructOpt)]
#[structopt(name = "hlsproxy", about = "Local HTTP Live Streaming proxy")]
pub enum Hlsproxy {
    #[structopt(name = "serve", about = "Proxy an HLS stream, choosing which rendition's segments the player receives")]
    Serve {
        #[structopt(env = "HLSPROXY_MANIFEST")]
        manifest: Url,
        #[structopt(long, default_value = "8080", env = "HLSPROXY_PORT")]
        port: u16,
        #[structopt(long, default_value = "127.0.0.1", env = "HLSPROXY_BIND")]
        bind: IpAddr,
        /// URL by which players reach the proxy, if not the bind address
        #[structopt(long, env = "HLSPROXY_PUBLIC_URL")]
        public_url: Option<Url>,
        /// min, mid, max or WIDTHxHEIGHT
        #[structopt(long, env = "HLSPROXY_QUALITY")]
        quality: Option<Quality>,
        #[structopt(long, default_value = "30", env = "HLSPROXY_TIMEOUT_SECS")]
        timeout_secs: u64,
    },
    #[structopt(name = "inspect", about = "Load an HLS playlist and print a summary of its renditions")]
    Inspect {
        manifest: Url,
        #[structopt(long, default_value = "30", env = "HLSPROXY_TIMEOUT_SECS")]
        timeout_secs: u64,
    },
}
