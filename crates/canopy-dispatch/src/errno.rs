use canopy_inodes::FsError;

/// Fixed mapping from the error taxonomy to kernel-protocol error numbers.
pub fn errno_for(err: &FsError) -> i32 {
    match err {
        FsError::NotFound(_) => libc::ENOENT,
        FsError::Exists(_) => libc::EEXIST,
        FsError::NotADirectory(_) => libc::ENOTDIR,
        FsError::IsADirectory(_) => libc::EISDIR,
        FsError::NotEmpty(_) => libc::ENOTEMPTY,
        FsError::InvalidArgument(_) => libc::EINVAL,
        FsError::PermissionDenied(_) => libc::EACCES,
        FsError::Io(_) => libc::EIO,
        FsError::StaleInode(_) => libc::ESTALE,
        FsError::Unsupported(_) => libc::ENOSYS,
        FsError::Parse(_) => libc::EIO,
        FsError::NoAttr(_) => libc::ENODATA,
        FsError::Internal(_) => libc::EIO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_types::InodeNumber;

    #[test]
    fn taxonomy_maps_to_fixed_numbers() {
        assert_eq!(errno_for(&FsError::NotFound("x".into())), libc::ENOENT);
        assert_eq!(errno_for(&FsError::Exists("x".into())), libc::EEXIST);
        assert_eq!(errno_for(&FsError::NotADirectory("x".into())), libc::ENOTDIR);
        assert_eq!(errno_for(&FsError::IsADirectory("x".into())), libc::EISDIR);
        assert_eq!(errno_for(&FsError::NotEmpty("x".into())), libc::ENOTEMPTY);
        assert_eq!(errno_for(&FsError::InvalidArgument("x".into())), libc::EINVAL);
        assert_eq!(errno_for(&FsError::PermissionDenied("x".into())), libc::EACCES);
        assert_eq!(errno_for(&FsError::Io("x".into())), libc::EIO);
        assert_eq!(
            errno_for(&FsError::StaleInode(InodeNumber::ROOT)),
            libc::ESTALE
        );
        assert_eq!(errno_for(&FsError::Unsupported("x")), libc::ENOSYS);
        assert_eq!(errno_for(&FsError::Parse("x".into())), libc::EIO);
        assert_eq!(errno_for(&FsError::NoAttr("x".into())), libc::ENODATA);
        assert_eq!(errno_for(&FsError::Internal("x".into())), libc::EIO);
    }
}
