mod common;

use std::sync::Arc;

use beegfs_csi::RunMode;
use beegfs_csi::identity::DRIVER_NAME;
use common::{Harness, volume_params, writer};
use libcsi::{
    Code, CreateVolumeRequest, CsiClient, CsiMessage, CsiServer, Endpoint, PluginCapability,
};
use tokio::sync::oneshot;

#[tokio::test]
async fn requests_round_trip_over_unix_socket() {
    let h = Harness::new(RunMode::All);
    let endpoint = Endpoint::Unix(h.path("csi/csi.sock"));

    let server = CsiServer::bind(&endpoint, Arc::clone(&h.driver))
        .await
        .unwrap();
    let (stop, stopped) = oneshot::channel::<()>();
    let serving = tokio::spawn(server.serve_with_shutdown(async move {
        let _ = stopped.await;
    }));

    let client = CsiClient::connect(&endpoint).await.unwrap();

    let probe = client.call(&CsiMessage::Probe).await.unwrap();
    assert!(matches!(probe, CsiMessage::ProbeResult(true)));

    match client.call(&CsiMessage::GetPluginInfo).await.unwrap() {
        CsiMessage::PluginInfoResponse(info) => assert_eq!(info.name, DRIVER_NAME),
        other => panic!("unexpected response {other}"),
    }

    match client.call(&CsiMessage::GetPluginCapabilities).await.unwrap() {
        CsiMessage::PluginCapabilitiesResponse(caps) => {
            assert_eq!(caps, [PluginCapability::ControllerService]);
        }
        other => panic!("unexpected response {other}"),
    }

    let created = client
        .call(&CsiMessage::CreateVolume(CreateVolumeRequest {
            name: "vol1".into(),
            capacity_bytes: 0,
            volume_capabilities: writer(),
            parameters: volume_params(),
        }))
        .await
        .unwrap();
    match created {
        CsiMessage::VolumeCreated(vol) => {
            assert_eq!(vol.volume_id.as_str(), "beegfs://10.0.0.1/export/vol1");
        }
        other => panic!("unexpected response {other}"),
    }

    let err = client
        .call(&CsiMessage::CreateVolume(CreateVolumeRequest {
            name: "vol2".into(),
            ..Default::default()
        }))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    let _ = stop.send(());
    serving.await.unwrap().unwrap();
    assert!(!h.path("csi/csi.sock").exists());
}
