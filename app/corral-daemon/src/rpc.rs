//! The RPC dispatcher.
//!
//! One decoded request plus a peer credential goes in; at most one response
//! comes out. Exactly one request variant must be populated. Handlers
//! return the first error they hit; a panic anywhere below is converted to
//! a single `Unknown` result with the partial payload cleared, so clients
//! never observe an inconsistent record.

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use tracing::debug;

use corral_container::{ContainerHolder, Cred, Error, Result, VolumeHolder};
use corral_protocol::{
    wire, ContainerRequest, ContainerResponse, ErrorCode, ValueListEntry, VolumeDescription,
};

/// Mutable daemon state the dispatcher works against.
pub struct Context {
    pub cholder: ContainerHolder,
    pub vholder: VolumeHolder,
}

/// Dispatches one request. `None` means the reply is suppressed (volume
/// create/destroy completing asynchronously).
pub async fn handle_request(
    ctx: &mut Context,
    req: &ContainerRequest,
    cred: Cred,
) -> Option<ContainerResponse> {
    debug!(uid = cred.uid, "-> {req:?}");

    let mut rsp = ContainerResponse::default();
    let mut send_reply = true;

    let outcome = AssertUnwindSafe(dispatch(ctx, req, &mut rsp, cred, &mut send_reply))
        .catch_unwind()
        .await;

    let result = match outcome {
        Ok(result) => result,
        Err(panic) => {
            send_reply = true;
            Err(Error::Unknown(panic_message(panic.as_ref())))
        }
    };

    match result {
        Ok(()) => {
            rsp.error = ErrorCode::Success as i32;
            rsp.error_msg.clear();
        }
        Err(e) => {
            // Drop any partially-built payload along with the error.
            rsp = ContainerResponse::with_error(e.code(), e.to_string());
        }
    }

    if send_reply {
        debug!("<- {rsp:?}");
        Some(rsp)
    } else {
        None
    }
}

async fn dispatch(
    ctx: &mut Context,
    req: &ContainerRequest,
    rsp: &mut ContainerResponse,
    cred: Cred,
    send_reply: &mut bool,
) -> Result<()> {
    if req.variant_count() != 1 {
        return Err(Error::InvalidMethod(format!(
            "expected exactly one request variant, got {}",
            req.variant_count()
        )));
    }

    if let Some(r) = &req.create {
        create_container(ctx, r, cred)
    } else if let Some(r) = &req.destroy {
        destroy_container(ctx, r, cred).await
    } else if let Some(_r) = &req.list {
        list_containers(ctx, rsp)
    } else if let Some(r) = &req.get_property {
        get_container_property(ctx, r, rsp)
    } else if let Some(r) = &req.set_property {
        set_container_property(ctx, r, cred)
    } else if let Some(r) = &req.get_data {
        get_container_data(ctx, r, rsp)
    } else if let Some(r) = &req.start {
        ctx.cholder.check_permission(&r.name, cred)?;
        ctx.cholder.start(&r.name).await
    } else if let Some(r) = &req.stop {
        ctx.cholder.check_permission(&r.name, cred)?;
        ctx.cholder.stop(&r.name).await
    } else if let Some(r) = &req.pause {
        ctx.cholder.check_permission(&r.name, cred)?;
        ctx.cholder.pause(&r.name).await
    } else if let Some(r) = &req.resume {
        ctx.cholder.check_permission(&r.name, cred)?;
        ctx.cholder.resume(&r.name).await
    } else if let Some(_r) = &req.property_list {
        list_property(ctx, rsp)
    } else if let Some(_r) = &req.data_list {
        list_data(ctx, rsp)
    } else if let Some(r) = &req.kill {
        ctx.cholder.check_permission(&r.name, cred)?;
        ctx.cholder.kill(&r.name, r.sig)
    } else if let Some(_r) = &req.version {
        version(rsp)
    } else if let Some(r) = &req.create_volume {
        let result = ctx
            .vholder
            .create(&r.name, &r.source, &r.quota, &r.flags, cred);
        if result.is_ok() {
            *send_reply = false;
        }
        result
    } else if let Some(r) = &req.destroy_volume {
        let result = ctx.vholder.destroy(&r.name, cred);
        if result.is_ok() {
            *send_reply = false;
        }
        result
    } else if let Some(_r) = &req.list_volumes {
        list_volumes(ctx, rsp)
    } else {
        Err(Error::InvalidMethod("invalid RPC method".into()))
    }
}

fn create_container(ctx: &mut Context, req: &wire::ContainerCreateRequest, cred: Cred) -> Result<()> {
    if ctx.cholder.get(&req.name).is_some() {
        return Err(Error::ContainerAlreadyExists("invalid name".into()));
    }
    ctx.cholder.create(&req.name, cred)
}

async fn destroy_container(
    ctx: &mut Context,
    req: &wire::ContainerDestroyRequest,
    cred: Cred,
) -> Result<()> {
    // The ownership check happens on a short-lived lookup; destruction
    // itself walks the child graph through the registry, never through the
    // reference we hold here.
    if ctx.cholder.get(&req.name).is_some() {
        ctx.cholder.check_permission(&req.name, cred)?;
    }
    ctx.cholder.destroy(&req.name).await
}

fn list_containers(ctx: &Context, rsp: &mut ContainerResponse) -> Result<()> {
    rsp.list = Some(wire::ContainerListResponse {
        name: ctx.cholder.list(),
    });
    Ok(())
}

fn get_container_property(
    ctx: &Context,
    req: &wire::ContainerGetPropertyRequest,
    rsp: &mut ContainerResponse,
) -> Result<()> {
    let value = ctx.cholder.get_property(&req.name, &req.property)?;
    rsp.get_property = Some(wire::ContainerGetPropertyResponse { value });
    Ok(())
}

fn set_container_property(
    ctx: &mut Context,
    req: &wire::ContainerSetPropertyRequest,
    cred: Cred,
) -> Result<()> {
    ctx.cholder.check_permission(&req.name, cred)?;
    ctx.cholder
        .set_property(&req.name, &req.property, &req.value, cred.is_privileged())
}

fn get_container_data(
    ctx: &Context,
    req: &wire::ContainerGetDataRequest,
    rsp: &mut ContainerResponse,
) -> Result<()> {
    let value = ctx.cholder.get_data(&req.name, &req.data)?;
    rsp.get_data = Some(wire::ContainerGetDataResponse { value });
    Ok(())
}

fn list_property(ctx: &Context, rsp: &mut ContainerResponse) -> Result<()> {
    let properties = &ctx.cholder.env().properties;
    let list = properties
        .names()
        .filter_map(|name| properties.get(name).ok())
        .filter(|d| !d.has_flags(corral_container::flags::HIDDEN))
        .map(|d| ValueListEntry {
            name: d.name.to_owned(),
            desc: d.desc.to_owned(),
        })
        .collect();
    rsp.property_list = Some(wire::ContainerPropertyListResponse { list });
    Ok(())
}

fn list_data(ctx: &Context, rsp: &mut ContainerResponse) -> Result<()> {
    let list = ctx
        .cholder
        .env()
        .data
        .all()
        .filter(|d| !d.has_flags(corral_container::flags::HIDDEN))
        .map(|d| ValueListEntry {
            name: d.name.to_owned(),
            desc: d.desc.to_owned(),
        })
        .collect();
    rsp.data_list = Some(wire::ContainerDataListResponse { list });
    Ok(())
}

fn version(rsp: &mut ContainerResponse) -> Result<()> {
    rsp.version = Some(wire::VersionResponse {
        tag: env!("CARGO_PKG_VERSION").to_owned(),
        revision: option_env!("CORRAL_REVISION").unwrap_or("unknown").to_owned(),
    });
    Ok(())
}

fn list_volumes(ctx: &Context, rsp: &mut ContainerResponse) -> Result<()> {
    let list = ctx
        .vholder
        .list()
        .into_iter()
        .map(|v| VolumeDescription {
            name: v.name().to_owned(),
            source: v.source().to_owned(),
            quota: v.quota().to_owned(),
            flags: v.flags().to_owned(),
        })
        .collect();
    rsp.volume_list = Some(wire::VolumeListResponse { list });
    Ok(())
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown error".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_config::Config;
    use corral_container::{Env, ProcessLauncher};
    use tempfile::TempDir;

    fn context(dir: &TempDir) -> Context {
        let mut config = Config::default();
        config.daemon.data_dir = dir.path().join("data");
        config.container.cgroup_root = dir.path().join("cgroup");
        config.volumes.pool_dir = dir.path().join("volumes");
        config.container.grace_period_ms = 50;
        config.container.freezer_wait_interval_ms = 1;

        let env = Env::new(config.clone(), Box::new(ProcessLauncher)).unwrap();
        Context {
            cholder: ContainerHolder::new(env),
            vholder: VolumeHolder::open(config.volumes.pool_dir).unwrap(),
        }
    }

    fn request() -> ContainerRequest {
        ContainerRequest::default()
    }

    #[tokio::test]
    async fn zero_variants_is_invalid_method() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(&dir);

        let rsp = handle_request(&mut ctx, &request(), Cred::root())
            .await
            .unwrap();
        assert_eq!(rsp.code(), ErrorCode::InvalidMethod);
    }

    #[tokio::test]
    async fn two_variants_is_invalid_method() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(&dir);

        let mut req = request();
        req.list = Some(wire::ContainerListRequest {});
        req.version = Some(wire::VersionRequest {});

        let rsp = handle_request(&mut ctx, &req, Cred::root()).await.unwrap();
        assert_eq!(rsp.code(), ErrorCode::InvalidMethod);
    }

    #[tokio::test]
    async fn create_then_list_shows_the_container() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(&dir);

        let mut req = request();
        req.create = Some(wire::ContainerCreateRequest { name: "a".into() });
        let rsp = handle_request(&mut ctx, &req, Cred::root()).await.unwrap();
        assert_eq!(rsp.code(), ErrorCode::Success);

        let mut req = request();
        req.list = Some(wire::ContainerListRequest {});
        let rsp = handle_request(&mut ctx, &req, Cred::root()).await.unwrap();
        assert_eq!(rsp.list.unwrap().name, vec!["a".to_owned()]);
    }

    #[tokio::test]
    async fn duplicate_create_already_exists() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(&dir);

        let mut req = request();
        req.create = Some(wire::ContainerCreateRequest { name: "a".into() });
        assert_eq!(
            handle_request(&mut ctx, &req, Cred::root())
                .await
                .unwrap()
                .code(),
            ErrorCode::Success
        );
        assert_eq!(
            handle_request(&mut ctx, &req, Cred::root())
                .await
                .unwrap()
                .code(),
            ErrorCode::ContainerAlreadyExists
        );
    }

    #[tokio::test]
    async fn property_and_data_lists_exclude_hidden_and_do_not_overlap() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(&dir);

        let mut req = request();
        req.property_list = Some(wire::ContainerPropertyListRequest {});
        let rsp = handle_request(&mut ctx, &req, Cred::root()).await.unwrap();
        let props: Vec<String> = rsp
            .property_list
            .unwrap()
            .list
            .into_iter()
            .map(|e| e.name)
            .collect();

        let mut req = request();
        req.data_list = Some(wire::ContainerDataListRequest {});
        let rsp = handle_request(&mut ctx, &req, Cred::root()).await.unwrap();
        let data: Vec<String> = rsp
            .data_list
            .unwrap()
            .list
            .into_iter()
            .map(|e| e.name)
            .collect();

        assert!(props.contains(&"memory_limit".to_owned()));
        assert!(!props.contains(&"owner_user".to_owned()));
        assert!(data.contains(&"state".to_owned()));
        assert!(!data.contains(&"start_errno".to_owned()));
        assert!(props.iter().all(|name| !data.contains(name)));
    }

    #[tokio::test]
    async fn set_property_requires_ownership() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(&dir);

        let alice = Cred::new(1000, 1000);
        let mallory = Cred::new(2000, 2000);

        let mut req = request();
        req.create = Some(wire::ContainerCreateRequest { name: "a".into() });
        handle_request(&mut ctx, &req, alice).await.unwrap();

        let mut req = request();
        req.set_property = Some(wire::ContainerSetPropertyRequest {
            name: "a".into(),
            property: "cpu_limit".into(),
            value: "50".into(),
        });
        let rsp = handle_request(&mut ctx, &req, mallory).await.unwrap();
        assert_eq!(rsp.code(), ErrorCode::PermissionDenied);

        let rsp = handle_request(&mut ctx, &req, alice).await.unwrap();
        assert_eq!(rsp.code(), ErrorCode::Success);
    }

    #[tokio::test]
    async fn superuser_only_property_needs_root() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(&dir);

        let alice = Cred::new(1000, 1000);
        let mut req = request();
        req.create = Some(wire::ContainerCreateRequest { name: "a".into() });
        handle_request(&mut ctx, &req, alice).await.unwrap();

        let mut req = request();
        req.set_property = Some(wire::ContainerSetPropertyRequest {
            name: "a".into(),
            property: "user".into(),
            value: "nobody".into(),
        });
        let rsp = handle_request(&mut ctx, &req, alice).await.unwrap();
        assert_eq!(rsp.code(), ErrorCode::PermissionDenied);

        // The slot is untouched.
        let mut req = request();
        req.get_property = Some(wire::ContainerGetPropertyRequest {
            name: "a".into(),
            property: "user".into(),
        });
        let rsp = handle_request(&mut ctx, &req, alice).await.unwrap();
        assert_eq!(rsp.get_property.unwrap().value, "root");
    }

    #[tokio::test]
    async fn volume_create_and_destroy_suppress_the_reply_on_success() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(&dir);

        let mut req = request();
        req.create_volume = Some(wire::VolumeCreateRequest {
            name: "data".into(),
            source: String::new(),
            quota: "10G".into(),
            flags: String::new(),
        });
        assert!(handle_request(&mut ctx, &req, Cred::root()).await.is_none());

        // Failure still replies.
        let rsp = handle_request(&mut ctx, &req, Cred::root()).await.unwrap();
        assert_eq!(rsp.code(), ErrorCode::InvalidValue);

        let mut req = request();
        req.destroy_volume = Some(wire::VolumeDestroyRequest { name: "data".into() });
        assert!(handle_request(&mut ctx, &req, Cred::root()).await.is_none());

        let rsp = handle_request(&mut ctx, &req, Cred::root()).await.unwrap();
        assert_eq!(rsp.code(), ErrorCode::VolumeDoesNotExist);
        assert!(rsp.error_msg.contains("data"));
    }

    #[tokio::test]
    async fn version_reports_the_crate_version() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(&dir);

        let mut req = request();
        req.version = Some(wire::VersionRequest {});
        let rsp = handle_request(&mut ctx, &req, Cred::root()).await.unwrap();
        assert_eq!(rsp.version.unwrap().tag, env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn unknown_container_everywhere() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(&dir);

        let mut req = request();
        req.start = Some(wire::ContainerStartRequest { name: "ghost".into() });
        let rsp = handle_request(&mut ctx, &req, Cred::root()).await.unwrap();
        assert_eq!(rsp.code(), ErrorCode::ContainerDoesNotExist);

        let mut req = request();
        req.get_data = Some(wire::ContainerGetDataRequest {
            name: "ghost".into(),
            data: "state".into(),
        });
        let rsp = handle_request(&mut ctx, &req, Cred::root()).await.unwrap();
        assert_eq!(rsp.code(), ErrorCode::ContainerDoesNotExist);
    }
}
