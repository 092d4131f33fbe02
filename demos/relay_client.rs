extern crate base64;
extern crate getopts;
extern crate hex;
extern crate hexplay;
extern crate ldaprelay;
#[macro_use]
extern crate log;
extern crate pretty_env_logger;

use std::env;
use std::io::{self, BufRead};
use std::path::Path;
use std::process;

use getopts::Options;
use hexplay::HexViewBuilder;

use ldaprelay::spnego::wrap_response_token;
use ldaprelay::{AuthStatus, LdapRelayClient, ProtocolClient, RelayConfig};

fn main() {
    let _ = pretty_env_logger::init();

    let args: Vec<String> = env::args().collect();
    let program = Path::new(&args[0])
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("relay_client");

    let mut opts = Options::new();

    opts.optopt("t", "target", "relay to the directory server", "ldap[s]://HOST[:PORT]");
    opts.optopt(
        "a",
        "authenticate",
        "base64 encoded authenticate message, `-` reads it from stdin",
        "<BASE64>",
    );
    opts.optopt("", "timeout", "connect and I/O timeout", "<MS>");
    opts.optflag("", "strip-signing", "clear the signing flag of the negotiate message");
    opts.optflag("", "verify-certificate", "validate the LDAPS server certificate");
    opts.optflag("h", "help", "print this help menu");

    let matches = match opts.parse(&args[1..]) {
        Ok(m) => m,
        Err(err) => {
            error!("fail to parse arguments, {}", err);
            process::exit(-1);
        }
    };

    if matches.opt_present("h") || matches.free.is_empty() {
        let brief = format!("Usage: {} [options] <base64 encoded negotiate message>", program);
        print!("{}", opts.usage(&brief));
        return;
    }

    let mut config: RelayConfig = match matches
        .opt_str("target")
        .unwrap_or_else(|| "ldap://127.0.0.1".to_owned())
        .parse()
    {
        Ok(config) => config,
        Err(err) => {
            error!("invalid target, {}", err);
            process::exit(-1);
        }
    };

    config.strip_signing = matches.opt_present("strip-signing");
    config.verify_certificate = matches.opt_present("verify-certificate");

    if let Some(timeout) = matches.opt_str("timeout").and_then(|s| s.parse().ok()) {
        config.connect_timeout_ms = Some(timeout);
        config.io_timeout_ms = Some(timeout);
    }

    let negotiate = match base64::decode(&matches.free[0]) {
        Ok(payload) => payload,
        Err(err) => {
            error!("fail to decode negotiate message, {}", err);
            process::exit(-1);
        }
    };

    trace!(
        "relaying negotiate message:\n{}",
        HexViewBuilder::new(&negotiate).row_width(16).finish()
    );

    let client = LdapRelayClient::new(config);

    if let Err(err) = client.init_connection() {
        error!("fail to connect {}, {}", client.config(), err);
        process::exit(1);
    }

    let challenge = match client.send_negotiate(&negotiate) {
        Ok(challenge) => challenge,
        Err(err) => {
            error!("fail to relay negotiate message, {}", err);
            let _ = client.kill_connection();
            process::exit(1);
        }
    };

    println!(
        r#"{} Challenge:
            Flags: {:?}
 Server Challenge: 0x{:016X}
      Target Name: {}
          Message: {}
         SPNEGO: {}"#,
        client.plugin_name(),
        challenge.message.flags,
        challenge.message.server_challenge,
        challenge.message.target_name().unwrap_or_default(),
        base64::encode(challenge.as_bytes()),
        hex::encode(wrap_response_token(challenge.as_bytes())),
    );

    if let Some(authenticate) = matches.opt_str("authenticate") {
        let authenticate = if authenticate == "-" {
            let mut line = String::new();

            if let Err(err) = io::stdin().lock().read_line(&mut line) {
                error!("fail to read authenticate message, {}", err);
                process::exit(-1);
            }

            line.trim().to_owned()
        } else {
            authenticate
        };

        let payload = match base64::decode(&authenticate) {
            Ok(payload) => payload,
            Err(err) => {
                error!("fail to decode authenticate message, {}", err);
                process::exit(-1);
            }
        };

        match client.send_auth(&payload, Some(challenge.message.server_challenge)) {
            Ok((_, AuthStatus::Success)) => {
                println!("relayed bind succeeded");

                if let Some(info) = client.server_info() {
                    println!(
                        "  dnsHostName: {}\n  defaultNamingContext: {}",
                        info.dns_host_name().unwrap_or_default(),
                        info.default_naming_context().unwrap_or_default()
                    );
                }
            }
            Ok((_, status)) => println!("relayed bind denied, status 0x{:08X}", status.code()),
            Err(err) => error!("fail to relay authenticate message, {}", err),
        }
    }

    if let Err(err) = client.kill_connection() {
        warn!("fail to close connection, {}", err);
    }
}
