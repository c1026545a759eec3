mod common;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use common::StaticLookup;
use mailwatch::errors::WatchError;
use mailwatch::provider::{profile_by_name, GENERIC};
use mailwatch::resolver::{probe_reachable, resolve, ConnectTarget, DnsLookup, ResolveOptions};
use tokio::net::TcpListener;

fn no_probe() -> ResolveOptions {
    ResolveOptions {
        probe: false,
        probe_timeout: Duration::from_secs(1),
    }
}

#[tokio::test]
async fn ip_literals_skip_dns() {
    let lookup = StaticLookup::new(vec![Ipv4Addr::new(1, 2, 3, 4)]);

    let target = resolve(&lookup, "10.1.2.3", 993, &GENERIC, &no_probe()).await.unwrap();

    assert_eq!(lookup.calls(), 0);
    assert_eq!(target.addr, Some("10.1.2.3:993".parse().unwrap()));
    assert_eq!(target.host, "10.1.2.3");
}

#[tokio::test]
async fn ipv6_literals_are_dialed_as_given() {
    let lookup = StaticLookup::new(Vec::new());

    let target = resolve(&lookup, "::1", 993, &GENERIC, &no_probe()).await.unwrap();

    assert_eq!(lookup.calls(), 0);
    assert_eq!(target, ConnectTarget::passthrough("::1", 993, None));
}

#[tokio::test]
async fn hostname_keeps_sni_name_and_picks_address() {
    let lookup = StaticLookup::new(vec![
        Ipv4Addr::new(198, 18, 0, 1),
        Ipv4Addr::new(93, 184, 216, 34),
    ]);

    let target = resolve(&lookup, "imap.example.com", 993, &GENERIC, &no_probe())
        .await
        .unwrap();

    assert_eq!(lookup.calls(), 1);
    assert_eq!(target.host, "imap.example.com");
    assert_eq!(
        target.addr,
        Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)), 993))
    );
    assert!(!target.is_preferred);
}

#[tokio::test(start_paused = true)]
async fn unsatisfying_answers_are_looked_up_again() {
    let gmail = profile_by_name("gmail").unwrap();
    let lookup = StaticLookup::new(vec![Ipv4Addr::new(142, 250, 4, 108)]);
    lookup
        .answers
        .lock()
        .unwrap()
        .push_back(vec![Ipv4Addr::new(198, 18, 0, 9)]);

    let target = resolve(&lookup, "imap.gmail.com", 993, gmail, &no_probe())
        .await
        .unwrap();

    assert_eq!(lookup.calls(), 2);
    assert!(target.is_preferred);
    assert_eq!(target.addr.unwrap().ip(), IpAddr::V4(Ipv4Addr::new(142, 250, 4, 108)));
}

#[tokio::test(start_paused = true)]
async fn retries_stop_at_the_provider_limit() {
    let gmail = profile_by_name("gmail").unwrap();
    let lookup = StaticLookup::new(vec![Ipv4Addr::new(10, 9, 8, 7)]);

    let target = resolve(&lookup, "imap.gmail.com", 993, gmail, &no_probe())
        .await
        .unwrap();

    assert_eq!(lookup.calls() as u32, gmail.address.dns_retries + 1);
    assert!(!target.is_preferred);
    assert_eq!(target.addr.unwrap().ip(), IpAddr::V4(Ipv4Addr::new(10, 9, 8, 7)));
}

#[tokio::test]
async fn empty_answer_is_an_error() {
    let lookup = StaticLookup::new(Vec::new());

    let err = resolve(&lookup, "imap.example.com", 993, &GENERIC, &no_probe())
        .await
        .unwrap_err();

    assert!(matches!(err, WatchError::Network(_)));
}

#[tokio::test]
async fn probe_keeps_listening_candidates() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let reachable = probe_reachable(&[Ipv4Addr::LOCALHOST], port, Duration::from_secs(2)).await;

    assert_eq!(reachable, vec![Ipv4Addr::LOCALHOST]);
}

#[tokio::test]
async fn nothing_reachable_means_a_proxy_is_required() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let lookup = StaticLookup::new(Vec::new());
    let options = ResolveOptions {
        probe: true,
        probe_timeout: Duration::from_secs(2),
    };

    let err = resolve(&lookup, "127.0.0.1", port, &GENERIC, &options)
        .await
        .unwrap_err();

    assert_eq!(err, WatchError::ProxyRequired("127.0.0.1".into()));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn system_resolver_builds_without_network() {
    // Construction only reads local configuration.
    let _lookup = DnsLookup::new();
}
