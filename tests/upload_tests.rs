mod common;

use bytes::Bytes;
use common::{can_bind_localhost, client, config_for};
use futures::StreamExt;
use httpmock::Method::{DELETE, GET, PATCH, POST, PUT};
use httpmock::MockServer;
use registry_transfer::digest::EMPTY_BLOB_DIGEST;
use registry_transfer::registry::BlobUpload;
use registry_transfer::{CancellationToken, DigestUtils, RegistryError, UploadSession, UploadState};
use std::io::Cursor;
use std::time::Duration;

const CONTENT: &[u8] = b"0123456789";

#[tokio::test]
async fn test_chunked_upload_carries_rotating_location_state() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let server = MockServer::start_async().await;
    let digest = DigestUtils::compute_docker_digest(CONTENT);
    let upload_path = "/v2/app/blobs/uploads/u1";

    let initiate = server
        .mock_async(|when, then| {
            when.method(POST).path("/v2/app/blobs/uploads/");
            then.status(202)
                .header("Location", server.url(format!("{upload_path}?_state=s1")))
                .header("Docker-Upload-UUID", "u1")
                .header("Range", "0-0");
        })
        .await;

    let chunks = [("s1", "0-3", "0123", "s2"), ("s2", "4-7", "4567", "s3"), ("s3", "8-9", "89", "s4")];
    let mut chunk_mocks = Vec::new();
    for (state, range, body, next_state) in chunks {
        let end = range.split('-').nth(1).unwrap_or("0");
        chunk_mocks.push(
            server
                .mock_async(|when, then| {
                    when.method(PATCH)
                        .path(upload_path)
                        .query_param("_state", state)
                        .header("content-range", range)
                        .header("content-type", "application/octet-stream")
                        .body(body);
                    then.status(202)
                        .header("Location", format!("{upload_path}?_state={next_state}"))
                        .header("Docker-Upload-UUID", "u1")
                        .header("Range", format!("0-{end}"));
                })
                .await,
        );
    }

    let complete = server
        .mock_async(|when, then| {
            when.method(PUT)
                .path(upload_path)
                .query_param("_state", "s4")
                .query_param("digest", digest.as_str());
            then.status(201)
                .header("Docker-Content-Digest", digest.as_str())
                .header("Location", format!("/v2/app/blobs/{digest}"));
        })
        .await;
    let cancel_call = server
        .mock_async(|when, then| {
            when.method(DELETE).path(upload_path);
            then.status(204);
        })
        .await;

    let client = client(config_for(&server).with_chunk_size(4));
    let completed = client
        .blob_uploads()
        .upload_blob("app", &mut Cursor::new(CONTENT.to_vec()), &digest, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(completed.digest, digest);
    assert_eq!(completed.location, Some(format!("/v2/app/blobs/{digest}")));
    initiate.assert_hits_async(1).await;
    for mock in &chunk_mocks {
        mock.assert_hits_async(1).await;
    }
    complete.assert_hits_async(1).await;
    cancel_call.assert_hits_async(0).await;
}

#[tokio::test]
async fn test_failed_chunk_cancels_session_exactly_once() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/v2/app/blobs/uploads/");
            then.status(202)
                .header("Location", "/v2/app/blobs/uploads/u1")
                .header("Docker-Upload-UUID", "u1");
        })
        .await;
    let patch = server
        .mock_async(|when, then| {
            when.method(PATCH).path("/v2/app/blobs/uploads/u1");
            then.status(500).body("storage failure");
        })
        .await;
    let put = server
        .mock_async(|when, then| {
            when.method(PUT).path("/v2/app/blobs/uploads/u1");
            then.status(201);
        })
        .await;
    let cancel_call = server
        .mock_async(|when, then| {
            when.method(DELETE).path("/v2/app/blobs/uploads/u1");
            then.status(204);
        })
        .await;

    let client = client(config_for(&server).with_chunk_size(4));
    let digest = DigestUtils::compute_docker_digest(CONTENT);
    let err = client
        .blob_uploads()
        .upload_blob("app", &mut Cursor::new(CONTENT.to_vec()), &digest, &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.status().map(|s| s.as_u16()), Some(500));
    patch.assert_hits_async(1).await;
    put.assert_hits_async(0).await;
    cancel_call.assert_hits_async(1).await;
}

#[tokio::test]
async fn test_out_of_order_chunk_is_range_not_satisfiable() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(PATCH).path("/v2/app/blobs/uploads/u7");
            then.status(416).header("Range", "0-3");
        })
        .await;
    let cancel_call = server
        .mock_async(|when, then| {
            when.method(DELETE).path("/v2/app/blobs/uploads/u7");
            then.status(204);
        })
        .await;

    let client = client(config_for(&server));
    let uploads = client.blob_uploads();
    let session = registry_transfer::UploadSession::new("app", "u7", "/v2/app/blobs/uploads/u7");
    let chunk = registry_transfer::ChunkRange {
        begin: 8,
        end: 11,
        payload: Bytes::from_static(b"89ab"),
    };

    let err = uploads
        .transfer_chunk(session, &chunk, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::RangeNotSatisfiable(_)), "{err:?}");
    cancel_call.assert_hits_async(1).await;
}

#[tokio::test]
async fn test_failed_complete_returns_original_error_even_if_cancel_fails() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let server = MockServer::start_async().await;
    let put = server
        .mock_async(|when, then| {
            when.method(PUT).path("/v2/app/blobs/uploads/u2");
            then.status(400).body(r#"{"errors":[{"code":"DIGEST_INVALID"}]}"#);
        })
        .await;
    let cancel_call = server
        .mock_async(|when, then| {
            when.method(DELETE).path("/v2/app/blobs/uploads/u2");
            then.status(500).body("cannot delete");
        })
        .await;

    let client = client(config_for(&server));
    let session = registry_transfer::UploadSession::new("app", "u2", "/v2/app/blobs/uploads/u2");
    let err = client
        .blob_uploads()
        .complete(session, &DigestUtils::compute_docker_digest(CONTENT), None, &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.status().map(|s| s.as_u16()), Some(400));
    assert!(err.response().unwrap().body.contains("DIGEST_INVALID"));
    put.assert_hits_async(1).await;
    cancel_call.assert_hits_async(1).await;
}

#[tokio::test]
async fn test_cancellation_during_chunk_still_cancels_session() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(PATCH).path("/v2/app/blobs/uploads/u3");
            then.status(202).delay(Duration::from_secs(3));
        })
        .await;
    let cancel_call = server
        .mock_async(|when, then| {
            when.method(DELETE).path("/v2/app/blobs/uploads/u3");
            then.status(204);
        })
        .await;

    let client = client(config_for(&server));
    let session = registry_transfer::UploadSession::new("app", "u3", "/v2/app/blobs/uploads/u3");
    let chunk = registry_transfer::ChunkRange {
        begin: 0,
        end: 3,
        payload: Bytes::from_static(b"0123"),
    };

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let err = client
        .blob_uploads()
        .transfer_chunk(session, &chunk, &cancel)
        .await
        .unwrap_err();
    assert!(err.is_cancelled(), "{err:?}");
    cancel_call.assert_hits_async(1).await;
}

#[tokio::test]
async fn test_empty_source_takes_monolithic_path() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let server = MockServer::start_async().await;
    let monolithic = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v2/team/app/blobs/uploads/")
                .query_param("digest", EMPTY_BLOB_DIGEST);
            then.status(201)
                .header("Docker-Content-Digest", EMPTY_BLOB_DIGEST)
                .header("Location", format!("/v2/team/app/blobs/{EMPTY_BLOB_DIGEST}"));
        })
        .await;
    let initiate = server
        .mock_async(|when, then| {
            when.method(POST).path("/v2/team/app/blobs/uploads/");
            then.status(202).header("Location", "/v2/team/app/blobs/uploads/u1");
        })
        .await;
    let patch = server
        .mock_async(|when, then| {
            when.method(PATCH);
            then.status(202);
        })
        .await;
    let put = server
        .mock_async(|when, then| {
            when.method(PUT);
            then.status(201);
        })
        .await;

    let client = client(config_for(&server).with_repo_prefix("team"));
    let completed = client
        .blob_uploads()
        .upload_blob("app", &mut Cursor::new(Vec::new()), EMPTY_BLOB_DIGEST, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(completed.digest, EMPTY_BLOB_DIGEST);
    monolithic.assert_hits_async(1).await;
    initiate.assert_hits_async(0).await;
    patch.assert_hits_async(0).await;
    put.assert_hits_async(0).await;
}

#[tokio::test]
async fn test_small_blob_is_finalized_when_registry_opens_a_session() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let server = MockServer::start_async().await;
    let content = "seventeen-bytes!!";
    let digest = DigestUtils::compute_docker_digest(content.as_bytes());
    let post = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v2/app/blobs/uploads/")
                .query_param("digest", digest.as_str());
            then.status(202)
                .header("Location", "/v2/app/blobs/uploads/u1?_state=s")
                .header("Docker-Upload-UUID", "u1");
        })
        .await;
    let put = server
        .mock_async(|when, then| {
            when.method(PUT)
                .path("/v2/app/blobs/uploads/u1")
                .query_param("_state", "s")
                .query_param("digest", digest.as_str())
                .body(content);
            then.status(201)
                .header("Docker-Content-Digest", digest.as_str())
                .header("Location", format!("/v2/app/blobs/{digest}"));
        })
        .await;
    let delete = server
        .mock_async(|when, then| {
            when.method(DELETE);
            then.status(204);
        })
        .await;

    let client = client(config_for(&server));
    let completed = client
        .blob_uploads()
        .upload_blob("app", &mut Cursor::new(content.as_bytes().to_vec()), &digest, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(completed.digest, digest);
    let session = completed.session.expect("finalized through a session");
    assert_eq!(session.upload_id, "u1");
    assert_eq!(session.state, UploadState::Completed);
    post.assert_hits_async(1).await;
    put.assert_hits_async(1).await;
    delete.assert_hits_async(0).await;
}

#[tokio::test]
async fn test_small_blob_session_is_cancelled_when_finalize_fails() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/v2/app/blobs/uploads/");
            then.status(202).header("Location", "/v2/app/blobs/uploads/u2");
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(PUT).path("/v2/app/blobs/uploads/u2");
            then.status(400).body("digest invalid");
        })
        .await;
    let delete = server
        .mock_async(|when, then| {
            when.method(DELETE).path("/v2/app/blobs/uploads/u2");
            then.status(204);
        })
        .await;

    let client = client(config_for(&server));
    let digest = DigestUtils::compute_docker_digest(CONTENT);
    let err = client
        .blob_uploads()
        .upload_blob("app", &mut Cursor::new(CONTENT.to_vec()), &digest, &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.status(), Some(reqwest::StatusCode::BAD_REQUEST));
    delete.assert_hits_async(1).await;
}

#[tokio::test]
async fn test_unaddressable_session_is_reported() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/v2/app/blobs/uploads/");
            then.status(202);
        })
        .await;
    let put = server
        .mock_async(|when, then| {
            when.method(PUT);
            then.status(201);
        })
        .await;

    let client = client(config_for(&server));
    let digest = DigestUtils::compute_docker_digest(CONTENT);
    let err = client
        .blob_uploads()
        .upload_monolithic("app", Bytes::from_static(CONTENT), &digest, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, RegistryError::Parse(_)), "{err:?}");
    put.assert_hits_async(0).await;
}

#[tokio::test]
async fn test_cancelled_session_rejects_further_steps() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let server = MockServer::start_async().await;
    let delete = server
        .mock_async(|when, then| {
            when.method(DELETE).path("/v2/app/blobs/uploads/u3");
            then.status(204);
        })
        .await;
    let put = server
        .mock_async(|when, then| {
            when.method(PUT);
            then.status(201);
        })
        .await;

    let client = client(config_for(&server));
    let uploads = client.blob_uploads();
    let session = UploadSession::new("app", "u3", "/v2/app/blobs/uploads/u3");

    let cancelled = uploads.cancel(session).await;
    assert_eq!(cancelled.state, UploadState::Cancelled);
    delete.assert_hits_async(1).await;

    let digest = DigestUtils::compute_docker_digest(CONTENT);
    let err = uploads
        .complete(cancelled.clone(), &digest, None, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::InvalidArgument(_)), "{err:?}");

    uploads.cancel(cancelled).await;
    delete.assert_hits_async(1).await;
    put.assert_hits_async(0).await;
}

#[tokio::test]
async fn test_mount_and_upload_status() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let server = MockServer::start_async().await;
    let digest = DigestUtils::compute_docker_digest(CONTENT);
    let mount = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v2/app/blobs/uploads/")
                .query_param("mount", digest.as_str())
                .query_param("from", "base/image");
            then.status(201)
                .header("Docker-Content-Digest", digest.as_str())
                .header("Location", format!("/v2/app/blobs/{digest}"));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/v2/app/blobs/uploads/u5");
            then.status(204)
                .header("Docker-Upload-UUID", "u5")
                .header("Range", "0-99");
        })
        .await;

    let client = client(config_for(&server));
    let uploads = client.blob_uploads();
    let cancel = CancellationToken::new();

    let result = uploads.mount_blob("app", &digest, "base/image", &cancel).await.unwrap();
    assert!(result.is_mounted());
    assert_eq!(result.digest.as_deref(), Some(digest.as_str()));
    mount.assert_hits_async(1).await;

    let status = uploads.upload_status("app", "u5", &cancel).await.unwrap();
    assert_eq!(status.upload_id.as_deref(), Some("u5"));
    assert_eq!(status.range.as_deref(), Some("0-99"));
}

#[tokio::test]
async fn test_blob_read_operations() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let server = MockServer::start_async().await;
    let digest = DigestUtils::compute_docker_digest(CONTENT);
    let missing = DigestUtils::compute_docker_digest(b"missing");
    server
        .mock_async(|when, then| {
            when.method(GET).path(format!("/v2/app/blobs/{digest}"));
            then.status(200)
                .header("Docker-Content-Digest", digest.as_str())
                .body(CONTENT);
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(httpmock::Method::HEAD).path(format!("/v2/app/blobs/{missing}"));
            then.status(404);
        })
        .await;
    let delete = server
        .mock_async(|when, then| {
            when.method(DELETE).path(format!("/v2/app/blobs/{digest}"));
            then.status(202);
        })
        .await;

    let client = client(config_for(&server));
    let blobs = client.blobs();
    let cancel = CancellationToken::new();

    let mut download = blobs.get_blob("app", &digest, &cancel).await.unwrap();
    assert_eq!(download.digest, digest);
    let mut received = Vec::new();
    while let Some(chunk) = download.stream.next().await {
        received.extend_from_slice(&chunk.unwrap());
    }
    assert_eq!(received, CONTENT);

    assert!(!blobs.blob_exists("app", &missing, &cancel).await.unwrap());

    blobs.delete_blob("app", &digest, &cancel).await.unwrap();
    delete.assert_hits_async(1).await;
}

#[tokio::test]
async fn test_cancelling_a_streamed_download_ends_the_body() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let server = MockServer::start_async().await;
    let digest = DigestUtils::compute_docker_digest(CONTENT);
    server
        .mock_async(|when, then| {
            when.method(GET).path(format!("/v2/app/blobs/{digest}"));
            then.status(200)
                .header("Docker-Content-Digest", digest.as_str())
                .body(CONTENT);
        })
        .await;

    let client = client(config_for(&server));
    let cancel = CancellationToken::new();
    let mut download = client.blobs().get_blob("app", &digest, &cancel).await.unwrap();

    cancel.cancel();
    assert!(matches!(download.stream.next().await, Some(Err(RegistryError::Cancelled))));
    assert!(download.stream.next().await.is_none());
}

#[tokio::test]
async fn test_batch_upload_completes_every_blob() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let server = MockServer::start_async().await;
    let uploads = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v2/app/blobs/uploads/")
                .query_param_exists("digest");
            then.status(201);
        })
        .await;

    let client = client(config_for(&server).with_max_concurrency(2));
    let items: Vec<BlobUpload> = (0..5)
        .map(|i| BlobUpload::new("app", format!("blob-{i}").into_bytes()))
        .collect();

    let outcomes = client.upload_blobs(items, &CancellationToken::new()).await;

    assert_eq!(outcomes.len(), 5);
    for outcome in &outcomes {
        let completed = outcome.result.as_ref().unwrap();
        assert_eq!(completed.digest, outcome.digest);
    }
    uploads.assert_hits_async(5).await;
}
